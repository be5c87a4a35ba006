use crate::dml_io::{self, DmlIoError, MatrixFormat};
use crate::tensor::Matrix;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Failed to launch runtime `{command}`: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
    #[error("Runtime exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("Runtime reported an error: {0}")]
    ScriptError(String),
    #[error("Runtime wrote no outputs to {0}")]
    NoOutputs(PathBuf),
    #[error("Runtime wrote output \"{name}\" twice: {first} and {second}")]
    DuplicateOutput {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("Runtime I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unreadable runtime output: {0}")]
    Output(#[from] DmlIoError),
    #[error("Runtime command is empty")]
    EmptyCommand,
    #[error(transparent)]
    OtherError(#[from] anyhow::Error),
}

/// One script execution. All paths live in the case's private work directory.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub case: &'a str,
    /// The converter's script.
    pub script: &'a Path,
    /// Script to run instead of `script`; it sources `script` itself.
    pub driver: Option<&'a Path>,
    /// Materialised input matrices by DML argument name.
    pub inputs: &'a BTreeMap<String, PathBuf>,
    /// Where the executed script must write its outputs.
    pub output_dir: &'a Path,
}

impl ExecutionRequest<'_> {
    /// Named arguments every executed script receives.
    pub fn named_args(&self) -> Vec<(String, String)> {
        let mut args = vec![
            ("script".to_string(), self.script.to_string_lossy().to_string()),
            ("out_dir".to_string(), self.output_dir.to_string_lossy().to_string()),
        ];
        args.extend(
            self.inputs
                .iter()
                .map(|(name, path)| (name.clone(), path.to_string_lossy().to_string())),
        );
        args
    }
}

/// A runtime able to evaluate DML scripts.
pub trait ScriptRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError>;
}

impl<T: ScriptRuntime + ?Sized> ScriptRuntime for &T {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        (**self).execute(request)
    }
}

impl<T: ScriptRuntime + ?Sized> ScriptRuntime for Box<T> {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        (**self).execute(request)
    }
}

/// Turns DML argument names from arbitrary ONNX tensor names.
pub fn sanitize_arg_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !sanitized.starts_with(|c: char| c.is_ascii_alphabetic()) {
        sanitized.insert_str(0, "in_");
    }
    sanitized
}

/// Reads every matrix a script wrote into `output_dir`, named by file stem.
pub fn collect_outputs(
    output_dir: &Path,
    format: MatrixFormat,
) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
    let io_err = |source| RuntimeError::Io {
        path: output_dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(output_dir).map_err(io_err)? {
        paths.push(entry.map_err(io_err)?.path());
    }
    paths.sort();

    let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();
    for path in paths {
        if dml_io::is_metadata_file(&path) {
            continue;
        }
        let Some(name) = path.file_stem().map(|x| x.to_string_lossy().to_string()) else {
            continue;
        };
        if name.starts_with(['.', '_']) || name.is_empty() {
            continue;
        }
        if let Some(first) = sources.get(&name) {
            return Err(RuntimeError::DuplicateOutput {
                first: first.clone(),
                second: path,
                name,
            });
        }
        sources.insert(name, path);
    }
    if sources.is_empty() {
        return Err(RuntimeError::NoOutputs(output_dir.to_path_buf()));
    }

    let mut outputs = BTreeMap::new();
    for (name, path) in sources {
        outputs.insert(name, dml_io::read_matrix(&path, format)?);
    }
    Ok(outputs)
}

/// Executes scripts with the SystemDS launcher:
/// `systemds <driver-or-script> -nvargs script=.. out_dir=.. <input>=..`.
#[derive(Debug, Clone)]
pub struct SystemDsRuntime {
    command: Vec<String>,
    format: MatrixFormat,
}

impl SystemDsRuntime {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            format: MatrixFormat::default(),
        }
    }

    /// `$SYSTEMDS_ROOT/bin/systemds` when the variable is set, `systemds` from `PATH` otherwise.
    pub fn locate() -> Self {
        let launcher = std::env::var_os("SYSTEMDS_ROOT")
            .map(|root| PathBuf::from(root).join("bin").join("systemds"))
            .unwrap_or_else(|| PathBuf::from("systemds"));
        Self::new(vec![launcher.to_string_lossy().to_string()])
    }

    /// Format assumed for outputs written without `.mtd`.
    pub fn with_format(mut self, format: MatrixFormat) -> Self {
        self.format = format;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

// SystemDS can exit 0 after a failed script, reporting the exception on stderr
fn script_error(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .find(|line| {
            line.contains("DMLRuntimeException")
                || line.contains("LanguageException")
                || line.contains("ParseException")
        })
        .map(|line| line.trim().to_string())
}

impl ScriptRuntime for SystemDsRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        let (program, base_args) = self.command.split_first().ok_or(RuntimeError::EmptyCommand)?;
        let entry_point = request.driver.unwrap_or(request.script);

        let mut command = Command::new(program);
        command
            .args(base_args)
            .arg(entry_point)
            .arg("-nvargs")
            .args(
                request
                    .named_args()
                    .into_iter()
                    .map(|(name, value)| format!("{name}={value}")),
            )
            // scratch_space and friends go next to the outputs, not among them
            .current_dir(request.output_dir.parent().unwrap_or(request.output_dir))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        log::debug!("Running {} with {command:?}", request.case);

        let output = command.output().map_err(|source| RuntimeError::Launch {
            command: self.command.join(" "),
            source,
        })?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(RuntimeError::Failed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if let Some(message) = script_error(&stderr) {
            return Err(RuntimeError::ScriptError(message));
        }
        log::trace!("{} stdout: {}", request.case, String::from_utf8_lossy(&output.stdout));

        collect_outputs(request.output_dir, self.format)
    }
}
