//! covet-tracker: run-time hit counters for instrumented modules
//!
//! Every probe injected by `covet` ends in a call to
//! [`HitCountStore::record_hit`]. The store is a fixed-size table of atomic
//! counters, one per slot, shared by all threads of the monitored process.
//! When the process ends the counters are written to a hits file keyed by the
//! run identifier, where the collector picks them up.
//!
//! ```text
//! probe ──► record_hit(slot) ──► [AtomicU64; slots] ──flush──► <module>_<run>
//! ```
//!
//! Most modules use the [`registry`]: the table is allocated when the first
//! probe runs. The runtime's foundational library uses [`EmbeddedHits`]
//! instead, which needs no allocation or lock.

#![warn(missing_docs)]

mod embedded;
mod error;
mod hits_file;
pub mod registry;
mod store;

pub use embedded::EmbeddedHits;
pub use error::{TrackerError, TrackerResult};
pub use hits_file::{HitsFile, HITS_MAGIC, HITS_VERSION};
pub use registry::{FlushGuard, TrackerSpec};
pub use store::{HitCountStore, HitSink};
