//! Covet: line, branch and method coverage by instrumenting managed images
//!
//! Covet rewrites the method bodies of a compiled module so that every
//! tracked source line and branch path bumps a counter when it runs. After
//! the test process exits, the counters are read back and folded into a
//! coverage result that reporters render as LCOV, Cobertura, JSON or TeamCity
//! service messages.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    COVET Architecture                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │   ┌────────────┐    ┌────────────┐    ┌────────────┐            │
//! │   │ Module     │    │ Instrumen- │    │ Test run   │            │
//! │   │ + symbols  │───►│ ter        │───►│ (probes →  │            │
//! │   │            │    │            │    │  tracker)  │            │
//! │   └────────────┘    └────────────┘    └─────┬──────┘            │
//! │                                             │ hits file         │
//! │   ┌────────────┐    ┌────────────┐    ┌─────▼──────┐            │
//! │   │ Reporters  │◄───│ Coverage   │◄───│ Result     │            │
//! │   │            │    │ Summary    │    │ Collector  │            │
//! │   └────────────┘    └────────────┘    └────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use covet::{Coverage, CoverageParameters, ReporterFactory, write_report};
//! use std::path::Path;
//!
//! # fn main() -> covet::CovetResult<()> {
//! let params = CoverageParameters::builder()
//!     .exclude("[*.Tests]*")
//!     .exclude_attribute("Obsolete")
//!     .build()?;
//!
//! let mut session = Coverage::new(["bin/App.img"], &params);
//! session.prepare_modules()?;
//!
//! // ... run the tests against the instrumented modules ...
//!
//! let result = session.get_coverage_result();
//! let factory = ReporterFactory::new();
//! if let Some(lcov) = factory.create("lcov") {
//!     write_report(lcov, &result, Path::new("coverage"))?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![cfg_attr(test, allow(clippy::large_stack_arrays, clippy::large_stack_frames))]

pub mod config;
#[allow(clippy::cast_precision_loss, clippy::missing_errors_doc)]
pub mod coverage;
pub mod filter;
#[allow(clippy::missing_errors_doc, clippy::cast_possible_truncation)]
pub mod image;
#[allow(clippy::missing_errors_doc, clippy::cast_possible_truncation)]
pub mod instrumentation;
#[allow(clippy::missing_errors_doc, clippy::cast_precision_loss)]
pub mod reporters;
pub mod result;
#[allow(clippy::missing_errors_doc)]
pub mod symbols;

pub use config::{CoverageParameters, CoverageParametersBuilder};
pub use coverage::{
    Coverage, CoverageDetails, CoverageResult, CoverageSummary, FailureAction, ResultCollector,
};
pub use filter::{ExclusionFilter, ExclusionReason, MarkerKind, Member};
pub use image::{read_image, ModuleImage};
pub use instrumentation::{
    restore_original_module, Instrumenter, InstrumenterResult, ProbeInjector, ProbePlan,
};
pub use reporters::{
    percent, write_report, OutputType, Reporter, ReporterFactory, SourceRootTranslator,
};
pub use result::{CovetError, CovetResult};
pub use symbols::SymbolMap;

/// Prelude for convenient imports
pub mod prelude {
    pub use super::{
        write_report, Coverage, CoverageParameters, CoverageResult, CoverageSummary, CovetError,
        CovetResult, Instrumenter, ReporterFactory,
    };
}
