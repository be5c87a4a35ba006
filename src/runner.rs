use crate::compare::{ComparisonResult, Tolerance, compare_outputs};
use crate::converter::{self, Converter, ConverterError};
use crate::dml_io::{self, MatrixFormat};
use crate::error::{FailureKind, HarnessError, Stage};
use crate::fixture::{Fixture, FixtureStore, SINGLE_OUTPUT_NAME};
use crate::observer::CaseObserver;
use crate::runtime::{ExecutionRequest, RuntimeError, ScriptRuntime, sanitize_arg_name};
use crate::suite::{ExpectedSkip, Suite};
use crate::tensor::Matrix;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseState {
    Pending,
    Running(Stage),
    Passed,
    Failed(FailureKind),
}

impl CaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseState::Passed | CaseState::Failed(_))
    }
}

#[derive(Debug, Clone)]
pub struct CaseReport {
    pub case: String,
    /// Every output the runtime produced, compared or not.
    pub outputs: Vec<String>,
    pub comparison: ComparisonResult,
}

#[derive(Debug)]
pub enum Outcome {
    Passed(CaseReport),
    Failed(HarnessError),
}

impl Outcome {
    pub fn state(&self) -> CaseState {
        match self {
            Outcome::Passed(_) => CaseState::Passed,
            Outcome::Failed(error) => CaseState::Failed(error.kind()),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Outcome::Passed(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Passed(_) => None,
            Outcome::Failed(error) => Some(error.kind()),
        }
    }
}

impl From<Result<CaseReport, HarnessError>> for Outcome {
    fn from(result: Result<CaseReport, HarnessError>) -> Self {
        match result {
            Ok(report) => Outcome::Passed(report),
            Err(error) => Outcome::Failed(error),
        }
    }
}

#[derive(Debug)]
pub struct SuiteReport {
    pub suite: String,
    /// One outcome per active case, in suite order.
    pub outcomes: Vec<(String, Outcome)>,
    pub skipped: Vec<ExpectedSkip>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.outcomes.iter().filter(|(_, x)| x.is_passed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HarnessError> {
        self.outcomes.iter().filter_map(|(_, outcome)| match outcome {
            Outcome::Failed(error) => Some(error),
            Outcome::Passed(_) => None,
        })
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.outcomes.len()
    }
}

/// Runs named cases: locate, convert, execute, compare.
///
/// The runner holds no per-case state; every case gets its own work
/// directory, so one runner can serve any number of cases, concurrently or
/// repeatedly, with the same result for the same name.
pub struct FixtureRunner<S, C, R> {
    store: S,
    converter: C,
    runtime: R,
    tolerance: Tolerance,
    format: MatrixFormat,
    keep_work_dirs: bool,
}

impl<S: FixtureStore, C: Converter, R: ScriptRuntime> FixtureRunner<S, C, R> {
    pub fn new(store: S, converter: C, runtime: R) -> Self {
        Self {
            store,
            converter,
            runtime,
            tolerance: Tolerance::default(),
            format: MatrixFormat::default(),
            keep_work_dirs: false,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Format used when handing input matrices to the runtime.
    pub fn with_format(mut self, format: MatrixFormat) -> Self {
        self.format = format;
        self
    }

    /// Leave work directories behind for inspection.
    pub fn keep_work_dirs(mut self, keep: bool) -> Self {
        self.keep_work_dirs = keep;
        self
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn run_case(&self, name: &str) -> Result<CaseReport, HarnessError> {
        self.run_case_observed(name, &mut ())
    }

    pub fn run_case_observed(
        &self,
        name: &str,
        observer: &mut impl CaseObserver,
    ) -> Result<CaseReport, HarnessError> {
        observer.on_state_changed(name, &CaseState::Pending);
        log::info!("Running case: {name}");

        let result = self.run_stages(name, observer);
        match &result {
            Ok(report) => {
                log::info!(
                    "Case passed: {name} ({} element(s), max deviation {})",
                    report.comparison.compared_elements,
                    report.comparison.max_deviation
                );
                observer.on_state_changed(name, &CaseState::Passed);
            }
            Err(error) => {
                log::error!("Case failed: {error}");
                observer.on_state_changed(name, &CaseState::Failed(error.kind()));
            }
        }
        result
    }

    pub fn outcome(&self, name: &str) -> Outcome {
        self.run_case(name).into()
    }

    /// Runs the case and panics with the stage-tagged diagnostic on failure.
    pub fn assert_case(&self, name: &str) -> CaseReport {
        match self.run_case(name) {
            Ok(report) => report,
            Err(error) => panic!("{error}"),
        }
    }

    /// Runs every active case of `suite`; a failing case never stops the others.
    pub fn run_suite(&self, suite: &Suite) -> SuiteReport {
        for skip in suite.skips() {
            log::info!("Skipping {}: {}", skip.name, skip.reason);
        }
        let outcomes = suite
            .cases()
            .iter()
            .map(|case| (case.clone(), self.outcome(case)))
            .collect();
        let report = SuiteReport {
            suite: suite.name().to_string(),
            outcomes,
            skipped: suite.skips().to_vec(),
        };
        log::info!(
            "Suite {}: passed {}/{} ({} skipped)",
            report.suite,
            report.passed(),
            report.outcomes.len(),
            report.skipped.len()
        );
        report
    }

    fn stage<T>(
        &self,
        name: &str,
        stage: Stage,
        observer: &mut impl CaseObserver,
        body: impl FnOnce() -> T,
    ) -> T {
        observer.on_state_changed(name, &CaseState::Running(stage));
        log::debug!("  {name}: {stage}");
        let start = Instant::now();
        let result = body();
        observer.on_stage_finished(name, stage, start, Instant::now());
        result
    }

    fn run_stages(
        &self,
        name: &str,
        observer: &mut impl CaseObserver,
    ) -> Result<CaseReport, HarnessError> {
        let fixture = self
            .stage(name, Stage::Locate, observer, || self.store.locate(name))
            .map_err(|source| HarnessError::FixtureNotFound {
                case: name.to_string(),
                source,
            })?;
        self.check_signature(&fixture);

        let script = self
            .stage(name, Stage::Convert, observer, || -> Result<String, ConverterError> {
                let script = self.converter.onnx_to_script(&fixture.model)?;
                converter::validate_script(&script)?;
                Ok(script)
            })
            .map_err(|source| HarnessError::ConversionError {
                case: name.to_string(),
                source,
            })?;

        let outputs = self
            .stage(name, Stage::Execute, observer, || self.execute(&fixture, &script))
            .map_err(|source| HarnessError::ExecutionError {
                case: name.to_string(),
                source,
            })?;

        let comparison = self.stage(name, Stage::Compare, observer, || {
            compare_outputs(&outputs, &fixture.expected, &self.tolerance)
        });
        if let Some(mismatch) = comparison.mismatch.clone() {
            return Err(HarnessError::MismatchError {
                case: name.to_string(),
                mismatch,
            });
        }

        for extra in outputs.keys().filter(|x| !fixture.expected.contains_key(*x)) {
            log::warn!("{name}: output \"{extra}\" has no expectation and was not compared");
        }

        Ok(CaseReport {
            case: name.to_string(),
            outputs: outputs.into_keys().collect(),
            comparison,
        })
    }

    fn check_signature(&self, fixture: &Fixture) {
        let graph_outputs: Vec<String> = fixture
            .model
            .outputs()
            .into_iter()
            .map(|x| x.name)
            .collect();
        for expected in fixture.expected.keys() {
            if expected != SINGLE_OUTPUT_NAME && !graph_outputs.contains(expected) {
                log::warn!(
                    "{}: expected output \"{expected}\" is not a graph output of the model ({graph_outputs:?})",
                    fixture.name
                );
            }
        }
    }

    fn execute(&self, fixture: &Fixture, script: &str) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", fixture.name))
            .keep(self.keep_work_dirs)
            .tempdir()
            .map_err(|source| RuntimeError::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        if self.keep_work_dirs {
            log::info!("{}: work directory {}", fixture.name, work_dir.path().display());
        }

        let script_path = work_dir.path().join(format!("{}.dml", fixture.name));
        write_file(&script_path, script)?;

        let driver_path = match &fixture.driver {
            Some(driver) => {
                let path = work_dir.path().join(format!("{}_wrapper.dml", fixture.name));
                write_file(&path, driver)?;
                Some(path)
            }
            None => None,
        };

        let inputs = self.materialize_inputs(work_dir.path(), &fixture.inputs)?;

        let output_dir = work_dir.path().join("outputs");
        create_dir(&output_dir)?;

        let request = ExecutionRequest {
            case: &fixture.name,
            script: &script_path,
            driver: driver_path.as_deref(),
            inputs: &inputs,
            output_dir: &output_dir,
        };
        self.runtime.execute(&request)
    }

    fn materialize_inputs(
        &self,
        work_dir: &Path,
        inputs: &BTreeMap<String, Matrix>,
    ) -> Result<BTreeMap<String, PathBuf>, RuntimeError> {
        let mut paths = BTreeMap::new();
        if inputs.is_empty() {
            return Ok(paths);
        }
        let input_dir = work_dir.join("inputs");
        create_dir(&input_dir)?;
        for (name, matrix) in inputs {
            let arg_name = sanitize_arg_name(name);
            let extension = match self.format {
                MatrixFormat::Text => "out",
                MatrixFormat::Csv => "csv",
            };
            let path = input_dir.join(format!("{arg_name}.{extension}"));
            dml_io::write_matrix(&path, matrix, self.format)?;
            paths.insert(arg_name, path);
        }
        Ok(paths)
    }
}

fn write_file(path: &Path, contents: &str) -> Result<(), RuntimeError> {
    fs::write(path, contents).map_err(|source| RuntimeError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn create_dir(path: &Path) -> Result<(), RuntimeError> {
    fs::create_dir_all(path).map_err(|source| RuntimeError::Io {
        path: path.to_path_buf(),
        source,
    })
}
