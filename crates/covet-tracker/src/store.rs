//! Shared Hit Counters
//!
//! One `AtomicU64` per slot. Probes call [`HitCountStore::record_hit`] from any
//! thread; the increment is a single relaxed `fetch_add` and never blocks.

use crate::error::TrackerResult;
use crate::hits_file::HitsFile;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Anything probes can report hits into
pub trait HitSink: Send + Sync {
    /// Record one execution of `slot`
    fn record_hit(&self, slot: u32);

    /// Copy of all counters
    fn snapshot(&self) -> Vec<u64>;
}

/// Process-wide counter table for one instrumented module
#[derive(Debug)]
pub struct HitCountStore {
    run_id: String,
    hits_file: PathBuf,
    counters: Box<[AtomicU64]>,
    single_hit: bool,
}

impl HitCountStore {
    /// Create a zeroed table with `slot_count` counters
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        hits_file: impl Into<PathBuf>,
        slot_count: usize,
        single_hit: bool,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            hits_file: hits_file.into(),
            counters: (0..slot_count).map(|_| AtomicU64::new(0)).collect(),
            single_hit,
        }
    }

    /// Record one execution of `slot`
    ///
    /// Slots beyond the table are ignored. In single-hit mode the counter
    /// only ever moves from 0 to 1.
    #[inline(always)]
    pub fn record_hit(&self, slot: u32) {
        let Some(counter) = self.counters.get(slot as usize) else {
            return;
        };
        if self.single_hit {
            if counter.load(Ordering::Relaxed) == 0 {
                counter.store(1, Ordering::Relaxed);
            }
        } else {
            let _ = counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Current value of one counter
    #[must_use]
    pub fn get(&self, slot: u32) -> u64 {
        self.counters
            .get(slot as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Persist the current counters to the hits file
    ///
    /// Counters are absolute, so flushing twice writes the same or a later
    /// snapshot. Increments racing with the flush land in the next one.
    pub fn flush(&self) -> TrackerResult<()> {
        let file = HitsFile::new(self.run_id.clone(), self.snapshot());
        file.write_atomic(&self.hits_file)?;
        tracing::debug!(
            run_id = %self.run_id,
            hits_file = %self.hits_file.display(),
            slots = self.counters.len(),
            "flushed hit counters"
        );
        Ok(())
    }

    /// Number of slots
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.counters.len()
    }

    /// Run identifier
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Where [`flush`](Self::flush) writes
    #[must_use]
    pub fn hits_file(&self) -> &Path {
        &self.hits_file
    }

    /// Whether single-hit mode is on
    #[must_use]
    pub fn is_single_hit(&self) -> bool {
        self.single_hit
    }
}

impl HitSink for HitCountStore {
    fn record_hit(&self, slot: u32) {
        HitCountStore::record_hit(self, slot);
    }

    fn snapshot(&self) -> Vec<u64> {
        HitCountStore::snapshot(self)
    }
}
