//! Error types for the hit tracker.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for tracker operations
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors raised while persisting or reading hit counters
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Hits file does not start with the expected magic bytes
    #[error("{path}: not a hits file")]
    BadMagic {
        /// File that was read
        path: PathBuf,
    },

    /// Hits file was written by an incompatible tracker
    #[error("{path}: unsupported hits file version {version}")]
    UnsupportedVersion {
        /// File that was read
        path: PathBuf,
        /// Version found in the header
        version: u16,
    },

    /// Hits file ended before all counters were read
    #[error("{path}: truncated hits file ({message})")]
    Truncated {
        /// File that was read
        path: PathBuf,
        /// What was missing
        message: String,
    },

    /// Run identifier is not valid UTF-8 or is too long to encode
    #[error("invalid run identifier: {message}")]
    InvalidRunId {
        /// Error message
        message: String,
    },

    /// A table is already attached under this key with another size
    #[error("tracker {key} is attached with {attached} slots, {requested} requested")]
    SlotCountMismatch {
        /// Registry key
        key: String,
        /// Slots of the attached table
        attached: usize,
        /// Slots asked for
        requested: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrackerError {
    pub(crate) fn truncated(path: &std::path::Path, message: impl Into<String>) -> Self {
        Self::Truncated {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}
