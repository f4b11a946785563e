//! Coverage collection and aggregation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  COVET COVERAGE SESSION                                           │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  prepare_modules:  Instrumenter ──► InstrumenterResult (per mod)  │
//! │                         │ (failure ⇒ SkipModule)                  │
//! │  ... monitored process runs, probes fill the hits files ...       │
//! │  get_coverage_result: ResultCollector ──► CoverageResult          │
//! │                         │ (failure ⇒ ZeroCoverage)                │
//! │                         ▼                                         │
//! │                  CoverageSummary ──► reporters                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod collector;
pub mod failure;
mod model;
mod summary;

pub use collector::ResultCollector;
pub use failure::{classify, FailureAction, ModuleFailure};
pub use model::{
    BranchInfo, Classes, CollectionFailure, CoverageResult, Documents, Lines, MethodCoverage,
    Methods, Modules,
};
pub use summary::{CoverageDetails, CoverageSummary, Measurable};

use crate::config::CoverageParameters;
use crate::instrumentation::{restore_original_module, Instrumenter, InstrumenterResult};
use crate::result::CovetResult;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// One coverage run over a set of modules
#[derive(Debug, Clone)]
pub struct Coverage {
    identifier: String,
    modules: Vec<PathBuf>,
    params: CoverageParameters,
    results: Vec<InstrumenterResult>,
    failures: Vec<ModuleFailure>,
}

impl Coverage {
    /// New session with a fresh run identifier
    #[must_use]
    pub fn new<I, P>(modules: I, params: &CoverageParameters) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            identifier: uuid::Uuid::new_v4().simple().to_string(),
            modules: modules.into_iter().map(Into::into).collect(),
            params: params.clone(),
            results: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Session picking up modules instrumented earlier, possibly by another process
    #[must_use]
    pub fn resume(
        identifier: impl Into<String>,
        params: &CoverageParameters,
        results: Vec<InstrumenterResult>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            modules: results.iter().map(|r| r.module_path.clone()).collect(),
            params: params.clone(),
            results,
            failures: Vec::new(),
        }
    }

    /// Use `identifier` as the run identifier
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Run identifier
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Modules instrumented so far
    #[must_use]
    pub fn results(&self) -> &[InstrumenterResult] {
        &self.results
    }

    /// Modules skipped because instrumentation failed
    #[must_use]
    pub fn failures(&self) -> &[ModuleFailure] {
        &self.failures
    }

    /// Instrument every module that can be instrumented
    ///
    /// A module that fails is left untouched and recorded in
    /// [`Self::failures`]; the others proceed. Only configuration errors
    /// abort the session.
    pub fn prepare_modules(&mut self) -> CovetResult<&[InstrumenterResult]> {
        self.params.validate()?;

        let mut seen = BTreeSet::new();
        for path in &self.modules {
            if !seen.insert(path.clone()) {
                continue;
            }
            let instrumenter = Instrumenter::new(path, &self.identifier, &self.params);
            if !instrumenter.can_instrument() {
                continue;
            }
            match instrumenter.instrument() {
                Ok(result) => self.results.push(result),
                Err(error) => {
                    let failure = ModuleFailure::new(path, &error);
                    if failure.action == FailureAction::Abort {
                        return Err(error);
                    }
                    warn!(
                        module = %path.display(),
                        error = %error,
                        action = ?failure.action,
                        "module skipped"
                    );
                    self.failures.push(failure);
                }
            }
        }
        info!(
            run_id = %self.identifier,
            instrumented = self.results.len(),
            skipped = self.failures.len(),
            "modules prepared"
        );
        Ok(&self.results)
    }

    /// Collect every instrumented module into one result
    ///
    /// A module whose hits cannot be read is still reported, with zero hits,
    /// and listed in [`CoverageResult::collection_errors`].
    #[must_use]
    pub fn get_coverage_result(&self) -> CoverageResult {
        let collector = ResultCollector::new(&self.params);
        let mut coverage = CoverageResult::new(self.identifier.clone(), self.params.clone());

        for result in &self.results {
            let documents = match collector.collect_documents(result) {
                Ok(documents) => documents,
                Err(error) => {
                    let failure = ModuleFailure::new(&result.module_path, &error);
                    warn!(
                        module = %result.module,
                        error = %error,
                        action = ?failure.action,
                        "collection failed, reporting zero coverage"
                    );
                    coverage.collection_errors.push(CollectionFailure {
                        module: result.module.clone(),
                        message: failure.message,
                    });
                    ResultCollector::zero_coverage(result)
                }
            };
            coverage.add_module(ResultCollector::module_key(result), documents);
        }
        debug!(run_id = %self.identifier, modules = coverage.modules.len(), "coverage collected");
        coverage
    }

    /// Put back every module that was backed up before instrumentation
    pub fn restore_modules(&self) -> CovetResult<()> {
        for result in self.results.iter().filter(|r| r.backup_path.is_some()) {
            restore_original_module(result)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
