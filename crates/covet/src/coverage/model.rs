//! Coverage result tree
//!
//! ```text
//! Modules:   module file name → Documents
//! Documents: source path      → Classes
//! Classes:   class name       → Methods
//! Methods:   signature        → MethodCoverage { lines, branches }
//! ```

use crate::config::CoverageParameters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hits per line number
pub type Lines = BTreeMap<u32, u64>;

/// Methods by signature
pub type Methods = BTreeMap<String, MethodCoverage>;

/// Classes by full name
pub type Classes = BTreeMap<String, Methods>;

/// Documents by source path
pub type Documents = BTreeMap<String, Classes>;

/// Modules by file name
pub type Modules = BTreeMap<String, Documents>;

/// One branch path with its hits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    /// Line
    pub line: u32,
    /// Branch instruction offset
    pub offset: u32,
    /// Path destination offset
    pub end_offset: u32,
    /// Path index
    pub path: u32,
    /// Ordinal on the line
    pub ordinal: u32,
    /// Hits
    pub hits: u64,
}

/// Lines and branches of one method
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCoverage {
    /// Line hits
    pub lines: Lines,
    /// Branch paths in ordinal order per line
    pub branches: Vec<BranchInfo>,
}

/// A module whose hits could not be collected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionFailure {
    /// Module name
    pub module: String,
    /// What went wrong
    pub message: String,
}

/// Coverage of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageResult {
    /// Run identifier
    pub identifier: String,
    /// Per-module coverage
    pub modules: Modules,
    /// Parameters used for the run
    pub parameters: CoverageParameters,
    /// Modules reported with zero coverage because collection failed
    pub collection_errors: Vec<CollectionFailure>,
}

impl CoverageResult {
    /// Empty result
    #[must_use]
    pub fn new(identifier: impl Into<String>, parameters: CoverageParameters) -> Self {
        Self {
            identifier: identifier.into(),
            modules: Modules::new(),
            parameters,
            collection_errors: Vec::new(),
        }
    }

    /// Add a module's documents; hits of a module already present are summed
    pub fn add_module(&mut self, name: impl Into<String>, documents: Documents) {
        let target = self.modules.entry(name.into()).or_default();
        for (path, classes) in documents {
            let doc = target.entry(path).or_default();
            for (class, methods) in classes {
                let cls = doc.entry(class).or_default();
                for (signature, method) in methods {
                    match cls.get_mut(&signature) {
                        Some(existing) => existing.absorb(&method),
                        None => {
                            let _ = cls.insert(signature, method);
                        }
                    }
                }
            }
        }
    }

    /// Whether nothing was collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Run identifier to print in a report; none in deterministic mode
    #[must_use]
    pub fn report_identifier(&self) -> Option<&str> {
        (!self.parameters.deterministic_report).then_some(self.identifier.as_str())
    }
}

impl MethodCoverage {
    fn absorb(&mut self, other: &Self) {
        for (line, hits) in &other.lines {
            let entry = self.lines.entry(*line).or_insert(0);
            *entry = entry.saturating_add(*hits);
        }
        for branch in &other.branches {
            match self
                .branches
                .iter_mut()
                .find(|b| b.line == branch.line && b.ordinal == branch.ordinal)
            {
                Some(existing) => existing.hits = existing.hits.saturating_add(branch.hits),
                None => self.branches.push(branch.clone()),
            }
        }
    }
}
