//! Instrumentation
//!
//! ```text
//! module ──► ExclusionFilter ──► plan slots ──► ProbeInjector ──► commit
//!              (per type/method)   (lines, branches)  (per body)      (image + symbols)
//! ```

pub mod backup;
mod ids;
pub mod injector;
mod instrumenter;
mod record;
pub mod stack;

pub use backup::restore_original_module;
pub use ids::{SlotAllocator, SlotId};
pub use injector::{ProbeInjector, ProbePlan, RewrittenBody};
pub use instrumenter::{Instrumenter, TRACKER_NAMESPACE};
pub use record::{Branch, Document, HitCandidate, InstrumenterResult, Line, MethodRecord};
