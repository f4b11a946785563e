//! Cobertura XML reporter
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <coverage line-rate="0.5" branch-rate="0.5" version="1.9" timestamp="1700000000">
//!   <packages>
//!     <package name="App" line-rate="0.5" branch-rate="0.5" complexity="1">
//!       <classes>
//!         <class name="App.Calc" filename="src/Calc.cs" line-rate="0.5" branch-rate="0.5">
//!           <methods>
//!             <method name="Pick" signature="(int32)" line-rate="0.5" branch-rate="0.5">
//!               <lines>...</lines>
//!             </method>
//!           </methods>
//!           <lines>
//!             <line number="10" hits="1" branch="true" condition-coverage="50% (1/2)"/>
//!           </lines>
//!         </class>
//!       </classes>
//!     </package>
//!   </packages>
//! </coverage>
//! ```
//!
//! Packages are modules. The timestamp is left out of deterministic reports.

use super::{rate, OutputType, Reporter, SourceRootTranslator};
use crate::coverage::{BranchInfo, CoverageDetails, CoverageResult, CoverageSummary, MethodCoverage};
use crate::result::CovetResult;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Cobertura XML format reporter
#[derive(Debug, Clone, Copy, Default)]
pub struct CoberturaReporter;

impl Reporter for CoberturaReporter {
    fn format(&self) -> &'static str {
        "cobertura"
    }

    fn extension(&self) -> Option<&'static str> {
        Some("cobertura.xml")
    }

    fn output_type(&self) -> OutputType {
        OutputType::File
    }

    fn supports_deterministic(&self) -> bool {
        true
    }

    fn report(&self, result: &CoverageResult, translator: &SourceRootTranslator) -> CovetResult<String> {
        let modules = &result.modules;
        let lines = CoverageSummary::calculate_line_coverage(modules);
        let branches = CoverageSummary::calculate_branch_coverage(modules);

        let mut xml = String::from(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
        xml.push('\n');
        let _ = write!(
            xml,
            r#"<coverage line-rate="{:.4}" branch-rate="{:.4}" lines-covered="{}" lines-valid="{}" branches-covered="{}" branches-valid="{}" version="1.9""#,
            rate(lines),
            rate(branches),
            lines.covered,
            lines.total,
            branches.covered,
            branches.total,
        );
        if !result.parameters.deterministic_report {
            let _ = write!(xml, r#" timestamp="{}""#, chrono::Utc::now().timestamp());
        }
        xml.push_str(">\n");
        xml.push_str("  <packages>\n");

        for (module, documents) in modules {
            let _ = writeln!(
                xml,
                r#"    <package name="{}" line-rate="{:.4}" branch-rate="{:.4}" complexity="{}">"#,
                escape(package_name(module)),
                rate(CoverageSummary::calculate_line_coverage(documents)),
                rate(CoverageSummary::calculate_branch_coverage(documents)),
                complexity(documents.values().flat_map(|c| c.values()).flat_map(|m| m.values())),
            );
            xml.push_str("      <classes>\n");

            for (path, classes) in documents {
                let filename = translator.translate(path);
                for (class, methods) in classes {
                    let _ = writeln!(
                        xml,
                        r#"        <class name="{}" filename="{}" line-rate="{:.4}" branch-rate="{:.4}" complexity="{}">"#,
                        escape(class),
                        escape(&filename),
                        rate(CoverageSummary::calculate_line_coverage(methods)),
                        rate(CoverageSummary::calculate_branch_coverage(methods)),
                        complexity(methods.values()),
                    );

                    xml.push_str("          <methods>\n");
                    let mut class_lines: BTreeMap<u32, (u64, Vec<&BranchInfo>)> = BTreeMap::new();
                    for (signature, method) in methods {
                        let (name, params) = split_signature(signature);
                        let _ = writeln!(
                            xml,
                            r#"            <method name="{}" signature="{}" line-rate="{:.4}" branch-rate="{:.4}" complexity="{}">"#,
                            escape(name),
                            escape(params),
                            rate(CoverageSummary::calculate_line_coverage(method)),
                            rate(CoverageSummary::calculate_branch_coverage(method)),
                            complexity(std::iter::once(method)),
                        );
                        xml.push_str("              <lines>\n");
                        for (&number, &hits) in &method.lines {
                            let on_line: Vec<&BranchInfo> =
                                method.branches.iter().filter(|b| b.line == number).collect();
                            write_line(&mut xml, "                ", number, hits, &on_line);
                            let entry = class_lines.entry(number).or_default();
                            entry.0 = entry.0.saturating_add(hits);
                            entry.1.extend(on_line);
                        }
                        xml.push_str("              </lines>\n");
                        xml.push_str("            </method>\n");
                    }
                    xml.push_str("          </methods>\n");

                    xml.push_str("          <lines>\n");
                    for (number, (hits, on_line)) in &class_lines {
                        write_line(&mut xml, "            ", *number, *hits, on_line);
                    }
                    xml.push_str("          </lines>\n");
                    xml.push_str("        </class>\n");
                }
            }

            xml.push_str("      </classes>\n");
            xml.push_str("    </package>\n");
        }

        xml.push_str("  </packages>\n");
        xml.push_str("</coverage>\n");
        Ok(xml)
    }
}

fn write_line(xml: &mut String, indent: &str, number: u32, hits: u64, branches: &[&BranchInfo]) {
    if branches.is_empty() {
        let _ = writeln!(
            xml,
            r#"{indent}<line number="{number}" hits="{hits}" branch="false"/>"#
        );
        return;
    }
    let covered = branches.iter().filter(|b| b.hits > 0).count() as u64;
    let details = CoverageDetails::new(covered, branches.len() as u64);
    let _ = writeln!(
        xml,
        r#"{indent}<line number="{number}" hits="{hits}" branch="true" condition-coverage="{}% ({covered}/{})"/>"#,
        super::percent(details).floor(),
        details.total,
    );
}

/// Cyclomatic complexity estimate: one per method plus one per extra branch path
fn complexity<'a>(methods: impl Iterator<Item = &'a MethodCoverage>) -> usize {
    methods
        .map(|m| {
            let paths = m.branches.len();
            let points = m
                .branches
                .iter()
                .map(|b| (b.line, b.offset))
                .collect::<std::collections::BTreeSet<_>>()
                .len();
            1 + paths - points
        })
        .sum()
}

/// `int32 App.Calc::Pick(int32)` → (`Pick`, `(int32)`)
fn split_signature(signature: &str) -> (&str, &str) {
    let after = signature.rsplit_once("::").map_or(signature, |(_, rest)| rest);
    match after.find('(') {
        Some(open) => (&after[..open], &after[open..]),
        None => (after, ""),
    }
}

fn package_name(module: &str) -> &str {
    module.rsplit_once('.').map_or(module, |(stem, _)| stem)
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::CoverageParameters;
    use crate::coverage::{Classes, Documents, Lines, Methods};

    fn result(deterministic: bool) -> CoverageResult {
        let params = CoverageParameters::builder()
            .deterministic_report(deterministic)
            .build()
            .unwrap();
        let branch = |path, hits| BranchInfo {
            line: 10,
            offset: 3,
            end_offset: 5,
            path,
            ordinal: path,
            hits,
        };
        let mut result = CoverageResult::new("run", params);
        result.add_module(
            "App.img",
            Documents::from([(
                "src/Calc.cs".to_string(),
                Classes::from([(
                    "App.Calc".to_string(),
                    Methods::from([(
                        "int32 App.Calc::Pick(int32)".to_string(),
                        MethodCoverage {
                            lines: Lines::from([(10, 1), (11, 1)]),
                            branches: vec![branch(0, 0), branch(1, 1)],
                        },
                    )]),
                )]),
            )]),
        );
        result
    }

    #[test]
    fn test_xml_shape() {
        let xml = CoberturaReporter
            .report(&result(false), &SourceRootTranslator::identity())
            .unwrap();
        assert!(xml.contains(r#"line-rate="1.0000" branch-rate="0.5000" lines-covered="2" lines-valid="2""#));
        assert!(xml.contains(r#"<package name="App""#));
        assert!(xml.contains(r#"<class name="App.Calc" filename="src/Calc.cs""#));
        assert!(xml.contains(r#"<method name="Pick" signature="(int32)""#));
        assert!(xml.contains(r#"<line number="10" hits="1" branch="true" condition-coverage="50% (1/2)"/>"#));
        assert!(xml.contains(r#"<line number="11" hits="1" branch="false"/>"#));
        assert!(xml.contains("timestamp="));
    }

    #[test]
    fn test_deterministic_has_no_timestamp() {
        let first = CoberturaReporter
            .report(&result(true), &SourceRootTranslator::identity())
            .unwrap();
        let second = CoberturaReporter
            .report(&result(true), &SourceRootTranslator::identity())
            .unwrap();
        assert!(!first.contains("timestamp="));
        assert_eq!(first, second);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(split_signature("void A.B::C(int32,string)"), ("C", "(int32,string)"));
        assert_eq!(split_signature("void A.B/<>c::<M>b__0()"), ("<M>b__0", "()"));
        assert_eq!(escape("<M>b__0"), "&lt;M&gt;b__0");
        assert_eq!(package_name("App.Core.img"), "App.Core");
    }
}
