use crate::compare::Tolerance;
use crate::converter::CommandConverter;
use crate::dml_io::MatrixFormat;
use crate::fixture::{DirectoryFixtureStore, FixtureLayout};
use crate::runner::FixtureRunner;
use crate::runtime::SystemDsRuntime;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "ONNX_DML_CONFIG";
pub const FIXTURE_PATH_ENV: &str = "ONNX_DML_FIXTURE_PATH";
pub const CONVERTER_ENV: &str = "ONNX_DML_CONVERTER";
pub const SYSTEMDS_ENV: &str = "ONNX_DML_SYSTEMDS";
pub const SYSTEMDS_ROOT_ENV: &str = "SYSTEMDS_ROOT";
pub const RTOL_ENV: &str = "ONNX_DML_RTOL";
pub const ATOL_ENV: &str = "ONNX_DML_ATOL";

/// Everything about a harness run that is not part of a fixture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub fixture_root: PathBuf,
    pub layout: FixtureLayout,
    pub tolerance: Tolerance,
    /// Converter template, see [`CommandConverter`].
    pub converter_command: Vec<String>,
    /// Full launcher command; `None` resolves `systemds` at run time.
    pub systemds_command: Option<Vec<String>>,
    pub matrix_format: MatrixFormat,
    pub keep_work_dirs: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fixture_root: PathBuf::from("tests/fixtures"),
            layout: FixtureLayout::default(),
            tolerance: Tolerance::default(),
            converter_command: CommandConverter::default().template().to_vec(),
            systemds_command: None,
            matrix_format: MatrixFormat::default(),
            keep_work_dirs: false,
        }
    }
}

/// A JSON array of arguments (`["/opt/my tools/systemds", "-debug"]`), or a
/// whitespace-separated command line when the value is not an array.
fn parse_command(variable: &str, command: &str) -> anyhow::Result<Vec<String>> {
    if command.trim_start().starts_with('[') {
        return serde_json::from_str(command)
            .with_context(|| format!("{variable} is not a JSON array of strings: {command}"));
    }
    Ok(command.split_whitespace().map(String::from).collect())
}

fn parse_tolerance(variable: &str, value: &str) -> anyhow::Result<f64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{variable} is not a number: {value}"))
}

impl HarnessConfig {
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read harness config {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse harness config {}", path.display()))
    }

    /// Defaults, then the file named by `ONNX_DML_CONFIG`, then individual variables.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_json_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies overrides from a variable lookup (normally the process environment).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(root) = lookup(FIXTURE_PATH_ENV) {
            self.fixture_root = PathBuf::from(root);
        }
        if let Some(command) = lookup(CONVERTER_ENV) {
            self.converter_command = parse_command(CONVERTER_ENV, &command)?;
        }
        if let Some(command) = lookup(SYSTEMDS_ENV) {
            self.systemds_command = Some(parse_command(SYSTEMDS_ENV, &command)?);
        } else if self.systemds_command.is_none()
            && let Some(root) = lookup(SYSTEMDS_ROOT_ENV)
        {
            let launcher = PathBuf::from(root).join("bin").join("systemds");
            self.systemds_command = Some(vec![launcher.to_string_lossy().to_string()]);
        }
        if let Some(rtol) = lookup(RTOL_ENV) {
            self.tolerance.rtol = parse_tolerance(RTOL_ENV, &rtol)?;
        }
        if let Some(atol) = lookup(ATOL_ENV) {
            self.tolerance.atol = parse_tolerance(ATOL_ENV, &atol)?;
        }
        let Tolerance { rtol, atol } = self.tolerance;
        if !(rtol.is_finite() && rtol >= 0.0 && atol.is_finite() && atol >= 0.0) {
            anyhow::bail!("Tolerances must be finite and non-negative, got {:?}", self.tolerance);
        }
        Ok(())
    }

    pub fn fixture_store(&self) -> DirectoryFixtureStore {
        DirectoryFixtureStore::new(&self.fixture_root)
            .with_layout(self.layout.clone())
            .with_format(self.matrix_format)
    }

    pub fn converter(&self) -> CommandConverter {
        CommandConverter::new(self.converter_command.clone())
    }

    pub fn runtime(&self) -> SystemDsRuntime {
        let runtime = match &self.systemds_command {
            Some(command) => SystemDsRuntime::new(command.clone()),
            None => SystemDsRuntime::locate(),
        };
        runtime.with_format(self.matrix_format)
    }

    pub fn runner(&self) -> FixtureRunner<DirectoryFixtureStore, CommandConverter, SystemDsRuntime> {
        FixtureRunner::new(self.fixture_store(), self.converter(), self.runtime())
            .with_tolerance(self.tolerance)
            .with_format(self.matrix_format)
            .keep_work_dirs(self.keep_work_dirs)
    }
}
