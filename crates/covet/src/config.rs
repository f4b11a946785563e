//! Coverage parameters
//!
//! One `CoverageParameters` value drives a whole run: instrumentation,
//! collection and reporting. It can be built in code, or read from YAML or
//! JSON.

use crate::result::{CovetError, CovetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Configuration for one coverage run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoverageParameters {
    /// `[module]type` expressions a type must match to be instrumented
    pub include_filters: Vec<String>,
    /// `[module]type` expressions that exclude types or whole modules
    pub exclude_filters: Vec<String>,
    /// Glob patterns over source paths whose lines are not tracked
    pub exclude_by_file: Vec<String>,
    /// Additional exclusion marker attribute names
    pub exclude_attributes: Vec<String>,
    /// Skip compiler-generated property accessors
    pub skip_auto_props: bool,
    /// Record at most one hit per slot
    pub single_hit: bool,
    /// Produce reports that are byte-identical across machines
    pub deterministic_report: bool,
    /// Skip modules none of whose source files exist locally
    pub exclude_modules_without_sources: bool,
    /// Leave hits files in place after collection
    pub keep_hits_files: bool,
    /// Where hits files are written (system temp dir when unset)
    pub hits_directory: Option<PathBuf>,
    /// Where original modules are copied before instrumentation
    pub backup_directory: Option<PathBuf>,
    /// Local path prefix to deterministic root, e.g. `/home/ci/src/` to `/_/`
    pub source_root_mappings: BTreeMap<String, String>,
}

impl CoverageParameters {
    /// Create default parameters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder
    #[must_use]
    pub fn builder() -> CoverageParametersBuilder {
        CoverageParametersBuilder::default()
    }

    /// Parse from YAML
    pub fn from_yaml_str(yaml: &str) -> CovetResult<Self> {
        let params: Self = serde_yaml_ng::from_str(yaml)?;
        params.validate()?;
        Ok(params)
    }

    /// Parse from JSON
    pub fn from_json_str(json: &str) -> CovetResult<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn load(path: &Path) -> CovetResult<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            _ => Err(CovetError::config(format!(
                "unrecognised configuration format: {}",
                path.display()
            ))),
        }
    }

    /// Reject values no run could use
    pub fn validate(&self) -> CovetResult<()> {
        if let Some(name) = self.exclude_attributes.iter().find(|n| n.trim().is_empty()) {
            return Err(CovetError::config(format!(
                "empty exclusion attribute name {name:?}"
            )));
        }
        if self.source_root_mappings.keys().any(String::is_empty) {
            return Err(CovetError::config("source root mapping with empty local path"));
        }
        Ok(())
    }

    /// Directory hits files are written to
    #[must_use]
    pub fn hits_directory(&self) -> PathBuf {
        self.hits_directory
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Builder for [`CoverageParameters`]
#[derive(Debug, Default)]
pub struct CoverageParametersBuilder {
    params: CoverageParameters,
}

impl CoverageParametersBuilder {
    /// Add an include filter
    #[must_use]
    pub fn include(mut self, filter: impl Into<String>) -> Self {
        self.params.include_filters.push(filter.into());
        self
    }

    /// Add an exclude filter
    #[must_use]
    pub fn exclude(mut self, filter: impl Into<String>) -> Self {
        self.params.exclude_filters.push(filter.into());
        self
    }

    /// Exclude source files matching a glob
    #[must_use]
    pub fn exclude_by_file(mut self, pattern: impl Into<String>) -> Self {
        self.params.exclude_by_file.push(pattern.into());
        self
    }

    /// Treat an attribute as an exclusion marker
    #[must_use]
    pub fn exclude_attribute(mut self, name: impl Into<String>) -> Self {
        self.params.exclude_attributes.push(name.into());
        self
    }

    /// Skip auto-property accessors
    #[must_use]
    pub fn skip_auto_props(mut self, enabled: bool) -> Self {
        self.params.skip_auto_props = enabled;
        self
    }

    /// Record at most one hit per slot
    #[must_use]
    pub fn single_hit(mut self, enabled: bool) -> Self {
        self.params.single_hit = enabled;
        self
    }

    /// Request deterministic reports
    #[must_use]
    pub fn deterministic_report(mut self, enabled: bool) -> Self {
        self.params.deterministic_report = enabled;
        self
    }

    /// Skip modules without local sources
    #[must_use]
    pub fn exclude_modules_without_sources(mut self, enabled: bool) -> Self {
        self.params.exclude_modules_without_sources = enabled;
        self
    }

    /// Keep hits files after collection
    #[must_use]
    pub fn keep_hits_files(mut self, enabled: bool) -> Self {
        self.params.keep_hits_files = enabled;
        self
    }

    /// Set the hits directory
    #[must_use]
    pub fn hits_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.params.hits_directory = Some(dir.into());
        self
    }

    /// Set the backup directory
    #[must_use]
    pub fn backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.params.backup_directory = Some(dir.into());
        self
    }

    /// Map a local source root to a deterministic one
    #[must_use]
    pub fn source_root(mut self, local: impl Into<String>, mapped: impl Into<String>) -> Self {
        let _ = self
            .params
            .source_root_mappings
            .insert(local.into(), mapped.into());
        self
    }

    /// Build and validate
    pub fn build(self) -> CovetResult<CoverageParameters> {
        self.params.validate()?;
        Ok(self.params)
    }
}
