//! Result and error types for Covet.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for Covet operations
pub type CovetResult<T> = Result<T, CovetError>;

/// Errors that can occur in Covet
#[derive(Debug, Error)]
pub enum CovetError {
    /// Module image or its symbols could not be read
    #[error("Failed to parse {path}: {message}")]
    Parse {
        /// File being parsed
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Module already carries a tracker binding
    #[error("Module {path} is already instrumented")]
    AlreadyInstrumented {
        /// Module path
        path: PathBuf,
    },

    /// A method body cannot be rewritten without changing its behaviour
    #[error("Cannot instrument {method}: {message}")]
    Rewrite {
        /// Method signature
        method: String,
        /// Error message
        message: String,
    },

    /// Hit data expected for a module is missing or unusable
    #[error("Coverage data for {module} unavailable at {hits_file}: {message}")]
    Collection {
        /// Module name
        module: String,
        /// Expected hits file
        hits_file: PathBuf,
        /// Error message
        message: String,
    },

    /// Reporter cannot honour the requested mode
    #[error("Reporter '{format}' does not support {mode}")]
    UnsupportedReportConfiguration {
        /// Reporter format identifier
        format: String,
        /// Requested mode
        mode: String,
    },

    /// Filter expression is malformed
    #[error("Invalid filter '{filter}': {message}")]
    InvalidFilter {
        /// The filter as given
        filter: String,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
    },

    /// Image or symbol encoding error
    #[error("Encoding error: {0}")]
    Encode(#[from] bincode::Error),

    /// Hit tracker error
    #[error("Tracker error: {0}")]
    Tracker(#[from] covet_tracker::TrackerError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

impl CovetError {
    /// Create a parse error
    #[must_use]
    pub fn parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a rewrite error
    #[must_use]
    pub fn rewrite(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rewrite {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid filter error
    #[must_use]
    pub fn invalid_filter(filter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.into(),
            message: message.into(),
        }
    }
}
