//! TeamCity service messages
//!
//! ```text
//! ##teamcity[buildStatisticValue key='CodeCoverageAbsLCovered' value='2']
//! ```

use super::{format_invariant, unsupported_deterministic, OutputType, Reporter, SourceRootTranslator};
use crate::coverage::{CoverageDetails, CoverageResult, CoverageSummary};
use crate::result::CovetResult;
use std::fmt::Write;

/// Absolute line, branch and method counts as build statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct TeamCityReporter;

impl Reporter for TeamCityReporter {
    fn format(&self) -> &'static str {
        "teamcity"
    }

    fn extension(&self) -> Option<&'static str> {
        None
    }

    fn output_type(&self) -> OutputType {
        OutputType::Console
    }

    fn supports_deterministic(&self) -> bool {
        false
    }

    fn report(&self, result: &CoverageResult, _: &SourceRootTranslator) -> CovetResult<String> {
        if result.parameters.deterministic_report {
            return Err(unsupported_deterministic(self.format()));
        }

        let mut output = String::new();
        statistic(&mut output, 'L', CoverageSummary::calculate_line_coverage(&result.modules));
        statistic(&mut output, 'B', CoverageSummary::calculate_branch_coverage(&result.modules));
        statistic(&mut output, 'M', CoverageSummary::calculate_method_coverage(&result.modules));
        Ok(output)
    }
}

#[allow(clippy::cast_precision_loss)]
fn statistic(output: &mut String, unit: char, details: CoverageDetails) {
    for (suffix, value) in [("Covered", details.covered), ("Total", details.total)] {
        let _ = writeln!(
            output,
            "##teamcity[buildStatisticValue key='CodeCoverageAbs{unit}{suffix}' value='{}']",
            format_invariant(value as f64)
        );
    }
}
