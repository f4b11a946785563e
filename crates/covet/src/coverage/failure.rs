//! Failure classification: skip the module vs report it at zero
//!
//! A module that cannot be instrumented never ran probes, so it is left out
//! of the report. A module that was instrumented but whose hits are missing
//! did run, so it is reported with zero coverage rather than silently
//! dropped.

use crate::result::CovetError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// What a session does with a failing module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureAction {
    /// Leave the module out of instrumentation and the report
    SkipModule,
    /// Report the module's structure with all hits zero
    ZeroCoverage,
    /// Abort the operation
    Abort,
}

/// A per-module failure seen by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleFailure {
    /// Module path
    pub module: PathBuf,
    /// Error text
    pub message: String,
    /// What was done about it
    pub action: FailureAction,
}

impl ModuleFailure {
    /// Record `error` for `module`
    #[must_use]
    pub fn new(module: impl Into<PathBuf>, error: &CovetError) -> Self {
        Self {
            module: module.into(),
            message: error.to_string(),
            action: classify(error),
        }
    }
}

/// Classify an error
#[must_use]
pub fn classify(error: &CovetError) -> FailureAction {
    match error {
        CovetError::Parse { .. }
        | CovetError::AlreadyInstrumented { .. }
        | CovetError::Rewrite { .. }
        | CovetError::Encode(_)
        | CovetError::Io(_) => FailureAction::SkipModule,
        CovetError::Collection { .. } | CovetError::Tracker(_) => FailureAction::ZeroCoverage,
        CovetError::UnsupportedReportConfiguration { .. }
        | CovetError::InvalidFilter { .. }
        | CovetError::Config { .. }
        | CovetError::Json(_)
        | CovetError::Yaml(_) => FailureAction::Abort,
    }
}
