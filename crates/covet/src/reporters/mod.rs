//! Coverage reporters
//!
//! Every reporter renders a [`CoverageResult`] to text. Reporters are looked
//! up by format identifier through [`ReporterFactory`].
//!
//! | format      | output  | extension       | deterministic |
//! |-------------|---------|-----------------|---------------|
//! | `teamcity`  | console | -               | no            |
//! | `lcov`      | file    | `info`          | yes           |
//! | `cobertura` | file    | `cobertura.xml` | yes           |
//! | `json`      | file    | `json`          | yes           |

mod cobertura;
mod json;
mod lcov;
mod source_root;
mod teamcity;

pub use cobertura::CoberturaReporter;
pub use json::JsonReporter;
pub use lcov::LcovReporter;
pub use source_root::SourceRootTranslator;
pub use teamcity::TeamCityReporter;

use crate::coverage::{CoverageDetails, CoverageResult};
use crate::instrumentation::backup::write_atomic;
use crate::result::{CovetError, CovetResult};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::info;

/// Where a reporter's output goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Printed by the caller
    Console,
    /// Written to `<dir>/coverage.<extension>`
    File,
}

/// Renders coverage results in one format
pub trait Reporter: Debug + Send + Sync {
    /// Format identifier
    fn format(&self) -> &'static str;

    /// File extension, for file reporters
    fn extension(&self) -> Option<&'static str>;

    /// Output destination
    fn output_type(&self) -> OutputType;

    /// Whether the reporter can produce deterministic output
    fn supports_deterministic(&self) -> bool;

    /// Render `result`
    ///
    /// # Errors
    ///
    /// Returns [`CovetError::UnsupportedReportConfiguration`] when asked for
    /// a mode the reporter does not support.
    fn report(&self, result: &CoverageResult, translator: &SourceRootTranslator)
        -> CovetResult<String>;
}

/// Reporters by format identifier
#[derive(Debug)]
pub struct ReporterFactory {
    reporters: BTreeMap<&'static str, Box<dyn Reporter>>,
}

impl Default for ReporterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ReporterFactory {
    /// Factory with the built-in reporters registered
    #[must_use]
    pub fn new() -> Self {
        let mut factory = Self {
            reporters: BTreeMap::new(),
        };
        factory.register(Box::new(TeamCityReporter));
        factory.register(Box::new(LcovReporter));
        factory.register(Box::new(CoberturaReporter));
        factory.register(Box::new(JsonReporter));
        factory
    }

    /// Add or replace a reporter
    pub fn register(&mut self, reporter: Box<dyn Reporter>) {
        let _ = self.reporters.insert(reporter.format(), reporter);
    }

    /// Reporter for `format`, matched case-insensitively
    #[must_use]
    pub fn create(&self, format: &str) -> Option<&dyn Reporter> {
        self.reporters
            .iter()
            .find(|(id, _)| id.eq_ignore_ascii_case(format))
            .map(|(_, reporter)| reporter.as_ref())
    }

    /// Registered format identifiers
    pub fn formats(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.reporters.keys().copied()
    }
}

/// Rendered report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutput {
    /// Format identifier
    pub format: String,
    /// File written, for file reporters
    pub path: Option<PathBuf>,
    /// Report text
    pub content: String,
}

/// Render `result` with `reporter`, writing file output under `output_dir`
///
/// A deterministic request the reporter cannot honour is rejected before
/// anything is rendered or written. Files are replaced atomically.
pub fn write_report(
    reporter: &dyn Reporter,
    result: &CoverageResult,
    output_dir: &Path,
) -> CovetResult<ReportOutput> {
    if result.parameters.deterministic_report && !reporter.supports_deterministic() {
        return Err(unsupported_deterministic(reporter.format()));
    }

    let translator = SourceRootTranslator::new(&result.parameters);
    let content = reporter.report(result, &translator)?;

    let path = match (reporter.output_type(), reporter.extension()) {
        (OutputType::File, Some(extension)) => {
            std::fs::create_dir_all(output_dir)?;
            let path = output_dir.join(format!("coverage.{extension}"));
            write_atomic(&path, content.as_bytes())?;
            info!(format = reporter.format(), path = %path.display(), "wrote coverage report");
            Some(path)
        }
        _ => None,
    };

    Ok(ReportOutput {
        format: reporter.format().to_string(),
        path,
        content,
    })
}

pub(crate) fn unsupported_deterministic(format: &str) -> CovetError {
    CovetError::UnsupportedReportConfiguration {
        format: format.to_string(),
        mode: "deterministic report".to_string(),
    }
}

/// Coverage percentage, rounded down to two decimals
///
/// Nothing to cover counts as fully covered.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent(details: CoverageDetails) -> f64 {
    if details.total == 0 {
        return 100.0;
    }
    let basis_points = u128::from(details.covered) * 10_000 / u128::from(details.total);
    basis_points as f64 / 100.0
}

/// Number with at most two decimals, trailing zeros dropped, `.` separator
#[must_use]
pub fn format_invariant(value: f64) -> String {
    let fixed = format!("{value:.2}");
    if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        fixed
    }
}

/// Covered over total as a ratio in `[0, 1]`, for formats that want rates
#[must_use]
pub(crate) fn rate(details: CoverageDetails) -> f64 {
    percent(details) / 100.0
}
