use crate::model::OnnxModel;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    #[error("Failed to launch converter `{command}`: {source}")]
    Launch {
        command: String,
        source: std::io::Error,
    },
    #[error("Converter `{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("Converter I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Converter produced an empty script")]
    EmptyScript,
    #[error("Converter output is not valid UTF-8")]
    NotUtf8,
    #[error("Converter command template is empty")]
    EmptyCommand,
    #[error(transparent)]
    OtherError(#[from] anyhow::Error),
}

/// The ONNX-to-DML translation capability the harness exercises.
pub trait Converter {
    fn onnx_to_script(&self, model: &OnnxModel) -> Result<String, ConverterError>;
}

impl<T: Converter + ?Sized> Converter for &T {
    fn onnx_to_script(&self, model: &OnnxModel) -> Result<String, ConverterError> {
        (**self).onnx_to_script(model)
    }
}

impl<T: Converter + ?Sized> Converter for Box<T> {
    fn onnx_to_script(&self, model: &OnnxModel) -> Result<String, ConverterError> {
        (**self).onnx_to_script(model)
    }
}

/// Rejects scripts no runtime could do anything with.
pub fn validate_script(script: &str) -> Result<(), ConverterError> {
    if script.trim().is_empty() {
        return Err(ConverterError::EmptyScript);
    }
    Ok(())
}

pub const MODEL_PLACEHOLDER: &str = "{model}";
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Runs an external converter process.
///
/// The command is a template: `{model}` is replaced with the path of the ONNX
/// file and `{output}` with the path the script should be written to. When the
/// template has no `{output}`, the script is taken from stdout instead.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    template: Vec<String>,
}

impl CommandConverter {
    pub fn new(template: Vec<String>) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &[String] {
        &self.template
    }

    fn writes_to_file(&self) -> bool {
        self.template.iter().any(|arg| arg.contains(OUTPUT_PLACEHOLDER))
    }

    fn render(&self, model_path: &Path, output_path: &Path) -> Result<Command, ConverterError> {
        let model = model_path.to_string_lossy();
        let output = output_path.to_string_lossy();
        let mut args = self.template.iter().map(|arg| {
            arg.replace(MODEL_PLACEHOLDER, &model)
                .replace(OUTPUT_PLACEHOLDER, &output)
        });
        let program = args.next().ok_or(ConverterError::EmptyCommand)?;
        let mut command = Command::new(program);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        Ok(command)
    }
}

impl Default for CommandConverter {
    fn default() -> Self {
        Self::new(
            ["python", "-m", "onnx_systemds.convert", MODEL_PLACEHOLDER, "-o", OUTPUT_PLACEHOLDER]
                .map(String::from)
                .to_vec(),
        )
    }
}

impl Converter for CommandConverter {
    fn onnx_to_script(&self, model: &OnnxModel) -> Result<String, ConverterError> {
        let work_dir = tempfile::tempdir().map_err(|source| ConverterError::Io {
            path: std::env::temp_dir(),
            source,
        })?;

        let model_path = match model.path() {
            Some(path) => path.to_path_buf(),
            None => {
                let path = work_dir.path().join("model.onnx");
                fs::write(&path, model.bytes()).map_err(|source| ConverterError::Io {
                    path: path.clone(),
                    source,
                })?;
                path
            }
        };
        let output_path = work_dir.path().join("model.dml");

        let mut command = self.render(&model_path, &output_path)?;
        let command_line = self.template.join(" ");
        log::debug!("Running converter: {command:?}");

        let output = command.output().map_err(|source| ConverterError::Launch {
            command: command_line.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(ConverterError::Failed {
                command: command_line,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let script_bytes = if self.writes_to_file() {
            fs::read(&output_path).map_err(|source| ConverterError::Io {
                path: output_path.clone(),
                source,
            })?
        } else {
            output.stdout
        };
        let script = String::from_utf8(script_bytes).map_err(|_| ConverterError::NotUtf8)?;
        validate_script(&script)?;
        Ok(script)
    }
}
