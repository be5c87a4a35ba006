use crate::harness_tests::*;
use ndarray::array;
use onnx_dml_harness::compare::{Mismatch, Tolerance};
use onnx_dml_harness::converter::ConverterError;
use onnx_dml_harness::error::{FailureKind, HarnessError, Stage};
use onnx_dml_harness::fixture::DirectoryFixtureStore;
use onnx_dml_harness::observer::StateRecorder;
use onnx_dml_harness::runner::{CaseState, FixtureRunner};
use onnx_dml_harness::dml_io::{self, MatrixFormat};
use onnx_dml_harness::runtime::{ExecutionRequest, RuntimeError, ScriptRuntime, collect_outputs};
use onnx_dml_harness::suite::Suite;
use onnx_dml_harness::tensor::Matrix;
use std::collections::BTreeMap;
use std::path::Path;

pub fn test_identity_fixture_passes(root: &Path) {
    write_identity_fixture(root, "identity", &sample_input());
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    let report = runner.run_case("identity").unwrap();
    assert_eq!(report.case, "identity");
    assert_eq!(report.outputs, vec!["Y".to_string()]);
    assert!(report.comparison.passed());
    assert_eq!(report.comparison.compared_elements, 6);
    assert_eq!(report.comparison.max_deviation, 0.0);
    assert_eq!(converter.calls(), 1);
}

pub fn test_perturbed_output_is_a_mismatch(root: &Path) {
    let mut expected = sample_input();
    expected[[1, 2]] += 0.5;
    write_identity_fixture(root, "perturbed", &expected);
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CopyRuntime,
    );

    let error = runner.run_case("perturbed").unwrap_err();
    assert_eq!(error.kind(), FailureKind::MismatchError);
    assert_eq!(error.stage(), Stage::Compare);
    let HarnessError::MismatchError { mismatch, .. } = &error else {
        panic!("unexpected error {error}");
    };
    match mismatch {
        Mismatch::Value {
            output,
            row,
            col,
            actual,
            expected,
            divergent,
            ..
        } => {
            assert_eq!(output, "Y");
            assert_eq!((*row, *col), (1, 2));
            assert_eq!(*actual, -0.125);
            assert_eq!(*expected, 0.375);
            assert_eq!(*divergent, 1);
        }
        other => panic!("unexpected mismatch {other}"),
    }
    assert!(error.to_string().starts_with("[compare] perturbed:"));
}

pub fn test_deviation_within_tolerance_passes(root: &Path) {
    let mut expected = sample_input();
    expected[[0, 0]] += 1e-6;
    write_identity_fixture(root, "close", &expected);

    let lenient = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CopyRuntime,
    );
    let report = lenient.run_case("close").unwrap();
    assert!(report.comparison.max_deviation > 0.0);

    let exact = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CopyRuntime,
    )
    .with_tolerance(Tolerance::exact());
    assert_eq!(
        exact.outcome("close").failure_kind(),
        Some(FailureKind::MismatchError)
    );
}

pub fn test_missing_model_skips_conversion(root: &Path) {
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    let error = runner.run_case("does_not_exist").unwrap_err();
    assert_eq!(error.kind(), FailureKind::FixtureNotFound);
    assert_eq!(error.case(), "does_not_exist");
    assert!(error.to_string().starts_with("[locate] does_not_exist:"));
    assert!(error.to_string().contains("ONNX model not found"));
    assert_eq!(converter.calls(), 0);
}

pub fn test_missing_expected_output_skips_conversion(root: &Path) {
    write_identity_fixture(root, "no_reference", &sample_input());
    std::fs::remove_dir_all(root.join("output_reference").join("no_reference")).unwrap();
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    let error = runner.run_case("no_reference").unwrap_err();
    assert_eq!(error.kind(), FailureKind::FixtureNotFound);
    assert!(error.to_string().contains("expected output not found"));
    assert_eq!(converter.calls(), 0);
}

pub fn test_corrupt_model_is_reported_at_locate(root: &Path) {
    write_identity_fixture(root, "corrupt", &sample_input());
    std::fs::write(root.join("test_models").join("corrupt.onnx"), [0xff, 0xff, 0xff]).unwrap();
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    let error = runner.run_case("corrupt").unwrap_err();
    assert_eq!(error.kind(), FailureKind::FixtureNotFound);
    assert!(error.to_string().contains("invalid ONNX model"));
    assert_eq!(converter.calls(), 0);
}

pub fn test_converter_failure_is_a_conversion_error(root: &Path) {
    write_identity_fixture(root, "dropout", &sample_input());
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), FailingConverter, CopyRuntime);

    let error = runner.run_case("dropout").unwrap_err();
    assert_eq!(error.kind(), FailureKind::ConversionError);
    assert!(error.to_string().starts_with("[convert] dropout:"));
    assert!(error.to_string().contains("Dropout"));
}

pub fn test_blank_script_is_a_conversion_error(root: &Path) {
    write_identity_fixture(root, "blank", &sample_input());
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), BlankConverter, CopyRuntime);

    match runner.run_case("blank").unwrap_err() {
        HarnessError::ConversionError {
            source: ConverterError::EmptyScript,
            ..
        } => {}
        other => panic!("unexpected error {other}"),
    }
}

pub fn test_runtime_failure_is_an_execution_error(root: &Path) {
    write_identity_fixture(root, "crash", &sample_input());
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CrashingRuntime,
    );

    let error = runner.run_case("crash").unwrap_err();
    assert_eq!(error.kind(), FailureKind::ExecutionError);
    assert!(error.to_string().starts_with("[execute] crash:"));
}

pub fn test_wrong_shape_is_a_mismatch(root: &Path) {
    write_identity_fixture(root, "shape", &sample_input());
    let outputs = BTreeMap::from([("Y".to_string(), Matrix::zeros((3, 2)))]);
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        FixedRuntime(outputs),
    );

    match runner.run_case("shape").unwrap_err() {
        HarnessError::MismatchError {
            mismatch:
                Mismatch::Shape {
                    actual, expected, ..
                },
            ..
        } => {
            assert_eq!(actual, (3, 2));
            assert_eq!(expected, (2, 3));
        }
        other => panic!("unexpected error {other}"),
    }
}

pub fn test_missing_output_is_a_mismatch(root: &Path) {
    write_identity_fixture(root, "renamed", &sample_input());
    let outputs = BTreeMap::from([("Z".to_string(), sample_input())]);
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        FixedRuntime(outputs),
    );

    match runner.run_case("renamed").unwrap_err() {
        HarnessError::MismatchError {
            mismatch: Mismatch::MissingOutput { output, produced },
            ..
        } => {
            assert_eq!(output, "Y");
            assert_eq!(produced, vec!["Z".to_string()]);
        }
        other => panic!("unexpected error {other}"),
    }
}

pub fn test_same_case_twice_gives_same_outcome(root: &Path) {
    write_identity_fixture(root, "identity", &sample_input());
    let mut perturbed = sample_input();
    perturbed[[0, 1]] = 100.0;
    write_identity_fixture(root, "perturbed", &perturbed);
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CopyRuntime,
    );

    for case in ["identity", "perturbed", "absent"] {
        let first = runner.outcome(case).state();
        let second = runner.outcome(case).state();
        assert_eq!(first, second, "{case}");
    }
    assert_eq!(runner.outcome("identity").state(), CaseState::Passed);
    assert_eq!(
        runner.outcome("perturbed").state(),
        CaseState::Failed(FailureKind::MismatchError)
    );
    assert_eq!(
        runner.outcome("absent").state(),
        CaseState::Failed(FailureKind::FixtureNotFound)
    );
}

pub fn test_states_follow_the_stages(root: &Path) {
    write_identity_fixture(root, "identity", &sample_input());
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        CopyRuntime,
    );

    let mut recorder = StateRecorder::default();
    runner.run_case_observed("identity", &mut recorder).unwrap();
    assert_eq!(
        recorder.states,
        vec![
            CaseState::Pending,
            CaseState::Running(Stage::Locate),
            CaseState::Running(Stage::Convert),
            CaseState::Running(Stage::Execute),
            CaseState::Running(Stage::Compare),
            CaseState::Passed,
        ]
    );
    assert_eq!(
        recorder.stages,
        vec![Stage::Locate, Stage::Convert, Stage::Execute, Stage::Compare]
    );

    let mut recorder = StateRecorder::default();
    runner.run_case_observed("absent", &mut recorder).unwrap_err();
    assert_eq!(
        recorder.states,
        vec![
            CaseState::Pending,
            CaseState::Running(Stage::Locate),
            CaseState::Failed(FailureKind::FixtureNotFound),
        ]
    );
    assert_eq!(recorder.states.iter().filter(|x| x.is_terminal()).count(), 1);
}

pub fn test_suite_runs_only_active_cases(root: &Path) {
    write_identity_fixture(root, "identity", &sample_input());
    write_identity_fixture(root, "excluded", &sample_input());
    let suite = Suite::new(
        "mixed",
        ["identity", "absent"],
        [("excluded", "known gap")],
    )
    .unwrap();
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    let report = runner.run_suite(&suite);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.passed(), 1);
    assert!(!report.all_passed());
    assert_eq!(report.failures().count(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].name, "excluded");
    // Only "identity" got as far as conversion
    assert_eq!(converter.calls(), 1);
}

struct DriverCheckingRuntime;

impl ScriptRuntime for DriverCheckingRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        let driver = request.driver.ok_or_else(|| anyhow::anyhow!("driver missing"))?;
        let source = std::fs::read_to_string(driver).unwrap();
        assert!(source.contains("source($script)"));
        let args = request.named_args();
        assert!(args.iter().any(|(name, _)| name == "script"));
        assert!(args.iter().any(|(name, _)| name == "out_dir"));
        assert!(args.iter().any(|(name, _)| name == "X"));
        CopyRuntime.execute(request)
    }
}

pub fn test_driver_is_handed_to_the_runtime(root: &Path) {
    write_identity_fixture(root, "wrapped", &sample_input());
    write_driver(
        root,
        "wrapped",
        "source($script) as gen\nX = read($X)\nY = gen::gen_identity(X)\nwrite(Y, $out_dir + \"/Y.out\", format=\"text\")\n",
    );
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        DriverCheckingRuntime,
    );
    runner.assert_case("wrapped");
}

pub fn test_single_reference_file(root: &Path) {
    write_identity_fixture(root, "single", &sample_input());
    std::fs::remove_dir_all(root.join("output_reference").join("single")).unwrap();
    std::fs::write(
        root.join("output_reference").join("single_reference.out"),
        "1 1 5\n2 2 6\n",
    )
    .unwrap();
    let outputs = BTreeMap::from([("out".to_string(), array![[5.0, 0.0], [0.0, 6.0]])]);
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        FixedRuntime(outputs),
    );
    runner.assert_case("single");
}

/// Copies like [`CopyRuntime`], except for case "bad", whose output names a
/// cell far outside any matrix that could be allocated.
struct OversizedOutputRuntime;

impl ScriptRuntime for OversizedOutputRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        if request.case != "bad" {
            return CopyRuntime.execute(request);
        }
        std::fs::write(
            request.output_dir.join("Y.out"),
            "1 1 1\n5000000000 5000000000 2\n",
        )
        .unwrap();
        collect_outputs(request.output_dir, MatrixFormat::Text)
    }
}

pub fn test_oversized_output_does_not_stop_the_suite(root: &Path) {
    write_identity_fixture(root, "bad", &sample_input());
    write_identity_fixture(root, "good", &sample_input());
    let suite = Suite::new("oversized", ["bad", "good"], [("skipped", "unused")]).unwrap();
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        OversizedOutputRuntime,
    );

    let report = runner.run_suite(&suite);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(
        report.outcomes[0].1.failure_kind(),
        Some(FailureKind::ExecutionError)
    );
    assert!(report.outcomes[1].1.is_passed());
    assert_eq!(report.passed(), 1);
}

pub fn test_unparseable_reference_is_reported_at_locate(root: &Path) {
    write_identity_fixture(root, "garbage", &sample_input());
    std::fs::write(
        root.join("output_reference").join("garbage").join("Y.out"),
        "1 1 not-a-number\n",
    )
    .unwrap();
    write_identity_fixture(root, "bad_metadata", &sample_input());
    std::fs::write(
        root.join("output_reference").join("bad_metadata").join("Y.out.mtd"),
        "{ \"rows\": ",
    )
    .unwrap();
    let converter = CountingConverter::default();
    let runner = FixtureRunner::new(DirectoryFixtureStore::new(root), &converter, CopyRuntime);

    for case in ["garbage", "bad_metadata"] {
        let error = runner.run_case(case).unwrap_err();
        assert_eq!(error.kind(), FailureKind::FixtureNotFound, "{case}");
        assert!(error.to_string().contains("invalid"), "{error}");
    }
    assert_eq!(converter.calls(), 0);
}

pub fn test_unparseable_runtime_output_is_an_execution_error(root: &Path) {
    struct GarbageRuntime;

    impl ScriptRuntime for GarbageRuntime {
        fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
            std::fs::write(request.output_dir.join("Y.out"), "1 1 1 1\n").unwrap();
            collect_outputs(request.output_dir, MatrixFormat::Text)
        }
    }

    write_identity_fixture(root, "garbled", &sample_input());
    let runner = FixtureRunner::new(
        DirectoryFixtureStore::new(root),
        CountingConverter::default(),
        GarbageRuntime,
    );

    match runner.run_case("garbled").unwrap_err() {
        HarnessError::ExecutionError {
            source: RuntimeError::Output(_),
            ..
        } => {}
        other => panic!("unexpected error {other}"),
    }
}

pub fn test_duplicate_output_names_are_rejected(root: &Path) {
    dml_io::write_matrix(&root.join("Y.out"), &sample_input(), MatrixFormat::Text).unwrap();
    dml_io::write_matrix(&root.join("Y.csv"), &sample_input(), MatrixFormat::Csv).unwrap();

    match collect_outputs(root, MatrixFormat::Text) {
        Err(RuntimeError::DuplicateOutput { name, .. }) => assert_eq!(name, "Y"),
        other => panic!("unexpected result {other:?}"),
    }
}
