//! Process-wide registry of counter tables.
//!
//! Lifecycle of a table:
//!
//! 1. The first probe of a module calls [`attach`] with the module's tracker
//!    key. The table is allocated once and handed out as an `Arc`. A second
//!    attach under the same key must ask for the same slot count; the host
//!    caches it next to the module so later probes never touch the registry.
//! 2. Probes increment through the cached `Arc` without locking.
//! 3. On exit the host calls [`flush_all`] (or holds a [`FlushGuard`]). A
//!    panic hook installed with [`install_panic_hook`] flushes before the
//!    process unwinds.
//!
//! The registry mutex is only taken by `attach`, `flush_all`, `get` and
//! `detach`.

use crate::error::{TrackerError, TrackerResult};
use crate::store::HitCountStore;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Once, OnceLock, PoisonError};

type Tables = Mutex<BTreeMap<String, Arc<HitCountStore>>>;

static TABLES: OnceLock<Tables> = OnceLock::new();
static PANIC_HOOK: Once = Once::new();

fn tables() -> &'static Tables {
    TABLES.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// What the host needs to know to allocate a module's table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSpec {
    /// Registry key, unique per module and run
    pub key: String,
    /// Run identifier written into the hits file
    pub run_id: String,
    /// Where the counters are flushed
    pub hits_file: PathBuf,
    /// Number of slots in the module
    pub slot_count: usize,
    /// Record at most one hit per slot
    pub single_hit: bool,
}

/// Return the table for `spec.key`, allocating it on first use
///
/// # Errors
///
/// [`TrackerError::SlotCountMismatch`] when a table of another size is
/// already attached under the key.
pub fn attach(spec: &TrackerSpec) -> TrackerResult<Arc<HitCountStore>> {
    let mut tables = tables().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = tables.get(&spec.key) {
        if existing.slot_count() != spec.slot_count {
            tracing::warn!(
                key = %spec.key,
                attached = existing.slot_count(),
                requested = spec.slot_count,
                "tracker already attached with a different slot count"
            );
            return Err(TrackerError::SlotCountMismatch {
                key: spec.key.clone(),
                attached: existing.slot_count(),
                requested: spec.slot_count,
            });
        }
        return Ok(Arc::clone(existing));
    }

    let store = Arc::new(HitCountStore::new(
        spec.run_id.clone(),
        spec.hits_file.clone(),
        spec.slot_count,
        spec.single_hit,
    ));
    let _ = tables.insert(spec.key.clone(), Arc::clone(&store));
    tracing::debug!(key = %spec.key, slots = spec.slot_count, "attached hit tracker");
    Ok(store)
}

/// Look up an attached table
pub fn get(key: &str) -> Option<Arc<HitCountStore>> {
    tables()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(key)
        .cloned()
}

/// Remove a table from the registry, returning it
pub fn detach(key: &str) -> Option<Arc<HitCountStore>> {
    tables()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key)
}

/// Flush every attached table
///
/// Every table is attempted even when an earlier one fails.
pub fn flush_all() -> Vec<(String, TrackerResult<()>)> {
    let snapshot: Vec<(String, Arc<HitCountStore>)> = tables()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(|(k, v)| (k.clone(), Arc::clone(v)))
        .collect();

    snapshot
        .into_iter()
        .map(|(key, store)| {
            let result = store.flush();
            if let Err(e) = &result {
                tracing::warn!(key = %key, error = %e, "failed to flush hit tracker");
            }
            (key, result)
        })
        .collect()
}

/// Flush all tables when a panic starts, then run the previous hook
///
/// Installing more than once has no further effect.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let _ = flush_all();
            previous(info);
        }));
    });
}

/// Flushes every attached table when dropped
#[derive(Debug, Default)]
pub struct FlushGuard {
    _private: (),
}

impl FlushGuard {
    /// Create a guard
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        let _ = flush_all();
    }
}
