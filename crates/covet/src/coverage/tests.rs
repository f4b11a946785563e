//! Session-level tests: instrument, fake a run, collect, aggregate.
//!
//! The hits a monitored process would leave behind are written straight
//! into the hits file; driving instrumented code is left to the
//! integration tests.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use super::*;
use crate::image::builder::{MethodBuilder, ModuleBuilder, TypeBuilder};
use crate::image::OpCode;
use crate::instrumentation::HitCandidate;
use covet_tracker::HitsFile;
use std::path::{Path, PathBuf};

fn pick_module(name: &str) -> ModuleBuilder {
    ModuleBuilder::new(name).ty(
        TypeBuilder::new(1, name, "Calc").method(
            MethodBuilder::new(10, "Pick")
                .param("int32")
                .returns("int32")
                .locals(1)
                .line("src/Calc.cs", 10)
                .ldarg(0)
                .branch(OpCode::BrtrueS, "yes")
                .ldc(2)
                .branch(OpCode::BrS, "store")
                .mark("yes")
                .ldc(1)
                .mark("store")
                .stloc(0)
                .line("src/Calc.cs", 11)
                .ldloc(0)
                .op(OpCode::Ret),
        ),
    )
}

fn write(dir: &Path, file: &str, builder: ModuleBuilder) -> PathBuf {
    let path = dir.join(file);
    let _ = builder.write(&path).unwrap();
    path
}

fn params(dir: &Path) -> CoverageParameters {
    CoverageParameters::builder()
        .hits_directory(dir)
        .build()
        .unwrap()
}

/// Hits for a run where only the listed candidates executed
fn fake_run(result: &InstrumenterResult, hit: impl Fn(&HitCandidate) -> u64) {
    let counts = result.hit_candidates.iter().map(hit).collect();
    HitsFile::new(result.run_id.clone(), counts)
        .write_atomic(&result.hits_file_path)
        .unwrap();
}

mod session_tests {
    use super::*;

    #[test]
    fn test_identifier_is_fresh_per_session() {
        let a = Coverage::new(Vec::<PathBuf>::new(), &CoverageParameters::default());
        let b = Coverage::new(Vec::<PathBuf>::new(), &CoverageParameters::default());
        assert_eq!(a.identifier().len(), 32);
        assert_ne!(a.identifier(), b.identifier());
        assert_eq!(a.with_identifier("fixed").identifier(), "fixed");
    }

    #[test]
    fn test_prepare_instruments_each_module_once() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let lib = write(dir.path(), "Lib.img", pick_module("Lib"));

        let mut session =
            Coverage::new([app.clone(), lib, app], &params(dir.path())).with_identifier("run");
        let prepared = session.prepare_modules().unwrap();
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].module, "App");
        assert_eq!(prepared[1].module, "Lib");
        assert!(session.failures().is_empty());
    }

    #[test]
    fn test_uninstrumentable_modules_are_passed_over() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let missing = dir.path().join("Missing.img");
        let system = write(
            dir.path(),
            "System.Text.img",
            pick_module("System.Text").system().reference("corelib"),
        );

        let mut session = Coverage::new([app, missing, system], &params(dir.path()));
        assert_eq!(session.prepare_modules().unwrap().len(), 1);
        assert!(session.failures().is_empty());
    }

    #[test]
    fn test_rewrite_failure_skips_only_that_module() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let broken = write(
            dir.path(),
            "Broken.img",
            ModuleBuilder::new("Broken").ty(
                TypeBuilder::new(1, "Broken", "Loop").method(
                    MethodBuilder::new(10, "Spin")
                        .mark("top")
                        .line("src/Loop.cs", 3)
                        .ldarg(0)
                        .branch(OpCode::Brtrue, "top"),
                ),
            ),
        );
        let before = std::fs::read(&broken).unwrap();

        let mut session = Coverage::new([broken.clone(), app], &params(dir.path()));
        let prepared = session.prepare_modules().unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].module, "App");

        let failures = session.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].module, broken);
        assert_eq!(failures[0].action, FailureAction::SkipModule);
        assert_eq!(std::fs::read(&broken).unwrap(), before);
    }

    #[test]
    fn test_invalid_configuration_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let mut params = params(dir.path());
        params.exclude_attributes.push(String::new());

        let mut session = Coverage::new([app], &params);
        assert!(session.prepare_modules().is_err());
        assert!(session.results().is_empty());
    }
}

mod collection_tests {
    use super::*;

    #[test]
    fn test_true_branch_only_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let mut session = Coverage::new([app], &params(dir.path()));
        let _ = session.prepare_modules().unwrap();

        // argument non-zero: both lines run, only the taken path of the branch
        fake_run(&session.results()[0], |candidate| match candidate {
            HitCandidate::Line { .. } => 1,
            HitCandidate::Branch { ordinal, .. } => u64::from(*ordinal == 1),
        });

        let result = session.get_coverage_result();
        assert!(result.collection_errors.is_empty());
        assert_eq!(result.identifier, session.identifier());
        assert_eq!(
            CoverageSummary::calculate_line_coverage(&result.modules),
            CoverageDetails::new(2, 2)
        );
        assert_eq!(
            CoverageSummary::calculate_branch_coverage(&result.modules),
            CoverageDetails::new(1, 2)
        );
        assert_eq!(
            CoverageSummary::calculate_method_coverage(&result.modules),
            CoverageDetails::new(1, 1)
        );
    }

    #[test]
    fn test_missing_hits_report_zero_coverage() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let lib = write(dir.path(), "Lib.img", pick_module("Lib"));
        let mut session = Coverage::new([app, lib], &params(dir.path()));
        let _ = session.prepare_modules().unwrap();
        fake_run(&session.results()[0], |_| 1);

        let result = session.get_coverage_result();
        assert_eq!(result.modules.len(), 2);
        assert_eq!(result.collection_errors.len(), 1);
        assert_eq!(result.collection_errors[0].module, "Lib");

        let lib = &result.modules["Lib.img"];
        assert_eq!(CoverageSummary::calculate_line_coverage(lib), CoverageDetails::new(0, 2));
        assert_eq!(CoverageSummary::calculate_method_coverage(lib), CoverageDetails::new(0, 1));
    }

    #[test]
    fn test_resume_from_saved_results() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let mut first = Coverage::new([app], &params(dir.path())).with_identifier("saved");
        let _ = first.prepare_modules().unwrap();
        let saved = dir.path().join("App.result.json");
        first.results()[0].save(&saved).unwrap();
        fake_run(&first.results()[0], |_| 4);

        let loaded = InstrumenterResult::load(&saved).unwrap();
        let second = Coverage::resume("saved", &params(dir.path()), vec![loaded]);
        let result = second.get_coverage_result();
        let method = &result.modules["App.img"]["src/Calc.cs"]["App.Calc"]["int32 App.Calc::Pick(int32)"];
        assert_eq!(method.lines[&10], 4);
        assert_eq!(method.lines[&11], 4);
    }

    #[test]
    fn test_parameters_travel_with_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let params = CoverageParameters::builder()
            .hits_directory(dir.path())
            .single_hit(true)
            .build()
            .unwrap();
        let session = Coverage::new(Vec::<PathBuf>::new(), &params);
        let result = session.get_coverage_result();
        assert!(result.is_empty());
        assert!(result.parameters.single_hit);
    }
}

mod restore_tests {
    use super::*;

    #[test]
    fn test_restore_puts_originals_back() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let before = std::fs::read(&app).unwrap();
        let params = CoverageParameters::builder()
            .hits_directory(dir.path())
            .backup_directory(dir.path().join("backup"))
            .build()
            .unwrap();

        let mut session = Coverage::new([app.clone()], &params);
        let _ = session.prepare_modules().unwrap();
        assert_ne!(std::fs::read(&app).unwrap(), before);

        session.restore_modules().unwrap();
        assert_eq!(std::fs::read(&app).unwrap(), before);
    }

    #[test]
    fn test_restore_without_backups_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let app = write(dir.path(), "App.img", pick_module("App"));
        let mut session = Coverage::new([app.clone()], &params(dir.path()));
        let _ = session.prepare_modules().unwrap();
        let instrumented = std::fs::read(&app).unwrap();

        session.restore_modules().unwrap();
        assert_eq!(std::fs::read(&app).unwrap(), instrumented);
    }
}

mod aggregation_tests {
    use super::*;

    fn method(lines: &[(u32, u64)]) -> MethodCoverage {
        MethodCoverage {
            lines: lines.iter().copied().collect(),
            branches: Vec::new(),
        }
    }

    #[test]
    fn test_every_level_measures_the_same_units() {
        let classes = Classes::from([
            (
                "A".to_string(),
                Methods::from([("void A::F()".to_string(), method(&[(1, 1), (2, 0)]))]),
            ),
            (
                "B".to_string(),
                Methods::from([("void B::G()".to_string(), method(&[(7, 0)]))]),
            ),
        ]);
        let documents = Documents::from([("a.cs".to_string(), classes.clone())]);
        let modules = Modules::from([("m".to_string(), documents.clone())]);

        let expected = CoverageDetails::new(1, 3);
        assert_eq!(CoverageSummary::calculate_line_coverage(&classes), expected);
        assert_eq!(CoverageSummary::calculate_line_coverage(&documents), expected);
        assert_eq!(CoverageSummary::calculate_line_coverage(&modules), expected);
        assert_eq!(
            CoverageSummary::calculate_method_coverage(&classes["B"]),
            CoverageDetails::new(0, 1)
        );
    }
}
