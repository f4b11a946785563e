//! Counter table for the foundational library.
//!
//! The runtime's own core library cannot rely on the registry: the registry
//! allocates lazily, takes a lock and uses collections that the core library
//! itself provides. Its table is therefore a fixed array usable in a `static`
//! and ready before any probe runs.

use crate::error::TrackerResult;
use crate::hits_file::HitsFile;
use crate::store::HitSink;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

/// Fixed-size, const-constructible counter table
#[derive(Debug)]
pub struct EmbeddedHits<const N: usize> {
    counters: [AtomicU64; N],
    single_hit: bool,
}

impl<const N: usize> EmbeddedHits<N> {
    /// Zeroed table, usable in `static` position
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counters: [ZERO; N],
            single_hit: false,
        }
    }

    /// Zeroed table whose counters stop at 1
    #[must_use]
    pub const fn single_hit() -> Self {
        Self {
            counters: [ZERO; N],
            single_hit: true,
        }
    }

    /// Record one execution of `slot`; slots beyond `N` are ignored
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

    /// Whether single-hit mode is on
    #[must_use]
    pub const fn is_single_hit(&self) -> bool {
        self.single_hit
    }

    /// Copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> Vec<u64> {
        self.counters
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Write the counters; the owner decides when, there is no exit hook
    pub fn flush_to(&self, run_id: &str, path: &Path) -> TrackerResult<()> {
        HitsFile::new(run_id, self.snapshot()).write_atomic(path)
    }
}

impl<const N: usize> Default for EmbeddedHits<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HitSink for EmbeddedHits<N> {
    fn record_hit(&self, slot: u32) {
        EmbeddedHits::record_hit(self, slot);
    }

    fn snapshot(&self) -> Vec<u64> {
        EmbeddedHits::snapshot(self)
    }
}
