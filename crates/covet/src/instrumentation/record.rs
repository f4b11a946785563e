//! Structural description of an instrumented module
//!
//! Produced by the instrumenter, persisted as JSON, and filled with hit
//! counts by the collector. Only the `hits` fields ever change.

use super::ids::SlotId;
use crate::filter::{ExclusionConflict, ExclusionReason};
use crate::result::CovetResult;
use crate::symbols::SequencePoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One tracked source line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Line {
    /// Line number
    pub number: u32,
    /// Owning class
    pub class: String,
    /// Owning method signature
    pub method: String,
    /// Hits
    pub hits: u64,
    /// At least one branch starts on this line
    pub is_branch_point: bool,
}

/// One path out of a conditional branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Line of the nearest preceding sequence point
    pub line: u32,
    /// Position among the branches of this line
    pub ordinal: u32,
    /// Offset of the branch instruction in the original body
    pub offset: u32,
    /// Where this path goes in the original body
    pub end_offset: u32,
    /// 0 for fall-through or default, k+1 for target k
    pub path: u32,
    /// Owning class
    pub class: String,
    /// Owning method signature
    pub method: String,
    /// Hits
    pub hits: u64,
}

/// One source file of the module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Source path as recorded in the symbols
    pub path: String,
    /// Index in the symbol table
    pub index: u32,
    /// Lines by number
    pub lines: BTreeMap<u32, Line>,
    /// Branches in offset then path order
    pub branches: Vec<Branch>,
}

impl Document {
    /// Empty document
    #[must_use]
    pub fn new(path: impl Into<String>, index: u32) -> Self {
        Self {
            path: path.into(),
            index,
            lines: BTreeMap::new(),
            branches: Vec::new(),
        }
    }
}

/// What a slot counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitCandidate {
    /// A source line
    Line {
        /// Document path
        document: String,
        /// Line number
        line: u32,
    },
    /// One path of a branch
    Branch {
        /// Document path
        document: String,
        /// Line number
        line: u32,
        /// Branch ordinal on that line
        ordinal: u32,
    },
}

/// Per-method bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodRecord {
    /// Owning class
    pub class: String,
    /// Why the method was skipped
    pub excluded: Option<ExclusionReason>,
    /// Sequence points of the original body, ascending offset
    pub sequence_points: Vec<SequencePoint>,
    /// Number of tracked branch paths
    pub branch_points: u32,
}

/// Everything needed to turn a hits file into coverage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumenterResult {
    /// Module name: file stem of the module
    pub module: String,
    /// Path of the instrumented module
    pub module_path: PathBuf,
    /// Where the run-time host flushes counters
    pub hits_file_path: PathBuf,
    /// Run identifier
    pub run_id: String,
    /// Documents by path
    pub documents: BTreeMap<String, Document>,
    /// Slot table: index is the slot
    pub hit_candidates: Vec<HitCandidate>,
    /// Methods by signature
    pub methods: BTreeMap<String, MethodRecord>,
    /// Full names of excluded types
    pub excluded_types: Vec<String>,
    /// Marker exclusions that overrode include filters
    pub conflicts: Vec<ExclusionConflict>,
    /// SHA-256 of the original module bytes, lowercase hex
    pub fingerprint: String,
    /// Copy of the original module, when backups are enabled
    pub backup_path: Option<PathBuf>,
}

impl InstrumenterResult {
    /// Number of slots
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.hit_candidates.len()
    }

    /// What `slot` counts
    #[must_use]
    pub fn candidate(&self, slot: SlotId) -> Option<&HitCandidate> {
        self.hit_candidates.get(slot.index())
    }

    /// Signatures of methods that were instrumented
    pub fn instrumented_methods(&self) -> impl Iterator<Item = &str> {
        self.methods
            .iter()
            .filter(|(_, m)| m.excluded.is_none())
            .map(|(sig, _)| sig.as_str())
    }

    /// Write as JSON
    pub fn save(&self, path: &Path) -> CovetResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read from JSON
    pub fn load(path: &Path) -> CovetResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
