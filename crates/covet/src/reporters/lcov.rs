//! LCOV tracefile reporter
//!
//! ## LCOV Format
//!
//! ```text
//! TN:<run identifier, empty in deterministic mode>
//! SF:<source file>
//! FN:<first line>,<method signature>
//! FNDA:<execution count>,<method signature>
//! FNF:<methods found>
//! FNH:<methods hit>
//! DA:<line>,<execution count>
//! BRDA:<line>,<branch offset>,<path>,<taken>
//! BRF:<branches found>
//! BRH:<branches hit>
//! LF:<lines found>
//! LH:<lines hit>
//! end_of_record
//! ```

use super::{OutputType, Reporter, SourceRootTranslator};
use crate::coverage::{CoverageResult, MethodCoverage};
use crate::result::CovetResult;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Methods grouped by translated source file
type FileMap<'a> = BTreeMap<String, Vec<(&'a str, &'a MethodCoverage)>>;

/// LCOV format reporter
#[derive(Debug, Clone, Copy, Default)]
pub struct LcovReporter;

impl Reporter for LcovReporter {
    fn format(&self) -> &'static str {
        "lcov"
    }

    fn extension(&self) -> Option<&'static str> {
        Some("info")
    }

    fn output_type(&self) -> OutputType {
        OutputType::File
    }

    fn supports_deterministic(&self) -> bool {
        true
    }

    fn report(&self, result: &CoverageResult, translator: &SourceRootTranslator) -> CovetResult<String> {
        let mut output = String::new();
        let _ = writeln!(output, "TN:{}", result.report_identifier().unwrap_or_default());

        for (file, methods) in &group_by_file(result, translator) {
            let _ = writeln!(output, "SF:{file}");

            // Functions (FN, FNDA)
            let mut functions_hit = 0;
            for (signature, method) in methods {
                let Some((&first, &count)) = method.lines.iter().next() else {
                    continue;
                };
                let _ = writeln!(output, "FN:{first},{signature}");
                let _ = writeln!(output, "FNDA:{count},{signature}");
                if method.lines.values().any(|&h| h > 0) {
                    functions_hit += 1;
                }
            }
            let functions = methods.iter().filter(|(_, m)| !m.lines.is_empty()).count();
            let _ = writeln!(output, "FNF:{functions}");
            let _ = writeln!(output, "FNH:{functions_hit}");

            // Line data (DA)
            let mut lines: BTreeMap<u32, u64> = BTreeMap::new();
            for (_, method) in methods {
                for (&line, &hits) in &method.lines {
                    let entry = lines.entry(line).or_insert(0);
                    *entry = entry.saturating_add(hits);
                }
            }
            for (line, count) in &lines {
                let _ = writeln!(output, "DA:{line},{count}");
            }

            // Branch data (BRDA)
            let mut branches_found = 0;
            let mut branches_hit = 0;
            for (_, method) in methods {
                for branch in &method.branches {
                    let taken = if branch.hits > 0 {
                        branch.hits.to_string()
                    } else {
                        "-".to_string()
                    };
                    let _ = writeln!(
                        output,
                        "BRDA:{},{},{},{taken}",
                        branch.line, branch.offset, branch.path
                    );
                    branches_found += 1;
                    if branch.hits > 0 {
                        branches_hit += 1;
                    }
                }
            }
            let _ = writeln!(output, "BRF:{branches_found}");
            let _ = writeln!(output, "BRH:{branches_hit}");

            let _ = writeln!(output, "LF:{}", lines.len());
            let _ = writeln!(output, "LH:{}", lines.values().filter(|&&h| h > 0).count());
            output.push_str("end_of_record\n");
        }

        Ok(output)
    }
}

/// Every method of every module, keyed by its translated document path
fn group_by_file<'a>(result: &'a CoverageResult, translator: &SourceRootTranslator) -> FileMap<'a> {
    let mut files: FileMap<'a> = BTreeMap::new();
    for documents in result.modules.values() {
        for (path, classes) in documents {
            let entry = files.entry(translator.translate(path)).or_default();
            for methods in classes.values() {
                entry.extend(methods.iter().map(|(sig, m)| (sig.as_str(), m)));
            }
        }
    }
    files
}
