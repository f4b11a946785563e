//! Result collection
//!
//! Reads the hits file a monitored process left behind and folds the counts
//! into the module's structural description.

use super::model::{BranchInfo, Classes, CoverageResult, Documents, MethodCoverage};
use crate::config::CoverageParameters;
use crate::instrumentation::{HitCandidate, InstrumenterResult};
use crate::result::{CovetError, CovetResult};
use covet_tracker::HitsFile;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Turns hits files into coverage
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    params: CoverageParameters,
}

impl ResultCollector {
    /// Collector for a run configured by `params`
    #[must_use]
    pub fn new(params: &CoverageParameters) -> Self {
        Self {
            params: params.clone(),
        }
    }

    /// Key under which a module appears in a [`CoverageResult`]
    #[must_use]
    pub fn module_key(result: &InstrumenterResult) -> String {
        result
            .module_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| result.module.clone())
    }

    /// Collect one module into a result of its own
    pub fn collect(&self, result: &InstrumenterResult) -> CovetResult<CoverageResult> {
        let documents = self.collect_documents(result)?;
        let mut coverage = CoverageResult::new(result.run_id.clone(), self.params.clone());
        coverage.add_module(Self::module_key(result), documents);
        Ok(coverage)
    }

    /// Read the hits file and produce the module's documents
    pub fn collect_documents(&self, result: &InstrumenterResult) -> CovetResult<Documents> {
        let failure = |message: String| CovetError::Collection {
            module: result.module.clone(),
            hits_file: result.hits_file_path.clone(),
            message,
        };

        let hits = HitsFile::read(&result.hits_file_path).map_err(|e| failure(e.to_string()))?;
        if hits.run_id != result.run_id {
            return Err(failure(format!(
                "hits file belongs to run {} but module was instrumented for run {}",
                hits.run_id, result.run_id
            )));
        }
        if hits.slot_count() != result.slot_count() {
            return Err(failure(format!(
                "hits file has {} slots, module has {}",
                hits.slot_count(),
                result.slot_count()
            )));
        }

        let mut filled = result.clone();
        apply_hits(&mut filled, &hits.counts);

        if !self.params.keep_hits_files {
            if let Err(e) = std::fs::remove_file(&result.hits_file_path) {
                warn!(file = %result.hits_file_path.display(), error = %e, "could not remove hits file");
            }
        }
        debug!(module = %result.module, slots = hits.slot_count(), "collected hits");
        Ok(to_documents(&filled))
    }

    /// The module's documents with every hit count zero
    #[must_use]
    pub fn zero_coverage(result: &InstrumenterResult) -> Documents {
        let mut zeroed = result.clone();
        for document in zeroed.documents.values_mut() {
            for line in document.lines.values_mut() {
                line.hits = 0;
            }
            for branch in &mut document.branches {
                branch.hits = 0;
            }
        }
        to_documents(&zeroed)
    }
}

fn apply_hits(result: &mut InstrumenterResult, counts: &[u64]) {
    let mut branch_index: HashMap<(String, u32, u32), usize> = HashMap::new();
    for (path, document) in &result.documents {
        for (i, branch) in document.branches.iter().enumerate() {
            let _ = branch_index.insert((path.clone(), branch.line, branch.ordinal), i);
        }
    }

    for (candidate, &count) in result.hit_candidates.iter().zip(counts) {
        if count == 0 {
            continue;
        }
        match candidate {
            HitCandidate::Line { document, line } => {
                if let Some(entry) = result
                    .documents
                    .get_mut(document)
                    .and_then(|d| d.lines.get_mut(line))
                {
                    entry.hits = entry.hits.saturating_add(count);
                }
            }
            HitCandidate::Branch {
                document,
                line,
                ordinal,
            } => {
                let key = (document.clone(), *line, *ordinal);
                if let (Some(doc), Some(&i)) =
                    (result.documents.get_mut(document), branch_index.get(&key))
                {
                    let branch = &mut doc.branches[i];
                    branch.hits = branch.hits.saturating_add(count);
                }
            }
        }
    }
}

fn to_documents(result: &InstrumenterResult) -> Documents {
    let mut documents = Documents::new();
    for (path, document) in &result.documents {
        let classes: &mut Classes = documents.entry(path.clone()).or_default();
        for line in document.lines.values() {
            let _ = classes
                .entry(line.class.clone())
                .or_default()
                .entry(line.method.clone())
                .or_insert_with(MethodCoverage::default)
                .lines
                .insert(line.number, line.hits);
        }
        for branch in &document.branches {
            classes
                .entry(branch.class.clone())
                .or_default()
                .entry(branch.method.clone())
                .or_insert_with(MethodCoverage::default)
                .branches
                .push(BranchInfo {
                    line: branch.line,
                    offset: branch.offset,
                    end_offset: branch.end_offset,
                    path: branch.path,
                    ordinal: branch.ordinal,
                    hits: branch.hits,
                });
        }
    }
    documents
}
