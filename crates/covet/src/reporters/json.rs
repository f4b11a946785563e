//! JSON reporter: the full result tree plus a summary block

use super::{percent, OutputType, Reporter, SourceRootTranslator};
use crate::coverage::{CoverageDetails, CoverageResult, CoverageSummary, Documents, Modules};
use crate::result::CovetResult;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct Totals {
    line: Ratio,
    branch: Ratio,
    method: Ratio,
}

#[derive(Debug, Serialize)]
struct Ratio {
    covered: u64,
    total: u64,
    percent: f64,
}

impl From<CoverageDetails> for Ratio {
    fn from(details: CoverageDetails) -> Self {
        Self {
            covered: details.covered,
            total: details.total,
            percent: percent(details),
        }
    }
}

#[derive(Debug, Serialize)]
struct JsonReport<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier: Option<&'a str>,
    summary: Totals,
    modules: Modules,
}

/// Pretty-printed JSON reporter
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn format(&self) -> &'static str {
        "json"
    }

    fn extension(&self) -> Option<&'static str> {
        Some("json")
    }

    fn output_type(&self) -> OutputType {
        OutputType::File
    }

    fn supports_deterministic(&self) -> bool {
        true
    }

    fn report(&self, result: &CoverageResult, translator: &SourceRootTranslator) -> CovetResult<String> {
        let modules: Modules = result
            .modules
            .iter()
            .map(|(name, documents)| {
                let translated: Documents = documents
                    .iter()
                    .map(|(path, classes)| (translator.translate(path), classes.clone()))
                    .collect();
                (name.clone(), translated)
            })
            .collect();

        let report = JsonReport {
            identifier: result.report_identifier(),
            summary: Totals {
                line: CoverageSummary::calculate_line_coverage(&modules).into(),
                branch: CoverageSummary::calculate_branch_coverage(&modules).into(),
                method: CoverageSummary::calculate_method_coverage(&modules).into(),
            },
            modules,
        };
        Ok(serde_json::to_string_pretty(&report)?)
    }
}
