use crate::dml_io::{self, DmlIoError, MatrixFormat};
use crate::model::{ModelError, OnnxModel};
use crate::tensor::{DecodedTensor, Matrix, TensorDecodingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum FixtureError {
    #[error("{what} not found at {location}")]
    Missing { what: &'static str, location: String },
    #[error("invalid case name \"{0}\"")]
    InvalidName(String),
    #[error("unreadable fixture {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid ONNX model {path}: {source}")]
    Model { path: PathBuf, source: ModelError },
    #[error("invalid tensor fixture {path}: {source}")]
    Tensor {
        path: PathBuf,
        source: TensorDecodingError,
    },
    #[error("invalid matrix fixture: {0}")]
    Matrix(#[from] DmlIoError),
    #[error("expected-output fixture {0} holds no outputs")]
    EmptyExpected(PathBuf),
}

/// Everything one case needs, loaded up front so later stages never touch the store.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub name: String,
    pub model: OnnxModel,
    /// DML source of the driver that sources the generated script and writes outputs.
    pub driver: Option<String>,
    pub inputs: BTreeMap<String, Matrix>,
    pub expected: BTreeMap<String, Matrix>,
}

pub trait FixtureStore {
    fn locate(&self, name: &str) -> Result<Fixture, FixtureError>;
}

impl<T: FixtureStore + ?Sized> FixtureStore for &T {
    fn locate(&self, name: &str) -> Result<Fixture, FixtureError> {
        (**self).locate(name)
    }
}

impl<T: FixtureStore + ?Sized> FixtureStore for Box<T> {
    fn locate(&self, name: &str) -> Result<Fixture, FixtureError> {
        (**self).locate(name)
    }
}

/// Directory names under the fixture root, relative to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixtureLayout {
    pub models: PathBuf,
    pub references: PathBuf,
    pub drivers: PathBuf,
    pub inputs: PathBuf,
}

impl Default for FixtureLayout {
    fn default() -> Self {
        Self {
            models: PathBuf::from("test_models"),
            references: PathBuf::from("output_reference"),
            drivers: PathBuf::from("dml_wrapper"),
            inputs: PathBuf::from("test_inputs"),
        }
    }
}

/// Fixture store over the on-disk layout:
///
/// ```text
/// test_models/<name>.onnx
/// output_reference/<name>/<output>.{out,csv,pb}   or   output_reference/<name>_reference.out
/// dml_wrapper/<name>_wrapper.dml                  (optional)
/// test_inputs/<name>/<input>.{pb,out,csv}         (optional)
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryFixtureStore {
    root: PathBuf,
    layout: FixtureLayout,
    format: MatrixFormat,
}

/// Output name used for the single-file `<name>_reference.out` form.
pub const SINGLE_OUTPUT_NAME: &str = "out";

impl DirectoryFixtureStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layout: FixtureLayout::default(),
            format: MatrixFormat::default(),
        }
    }

    pub fn with_layout(mut self, layout: FixtureLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Format assumed for matrix files that carry no `.mtd`.
    pub fn with_format(mut self, format: MatrixFormat) -> Self {
        self.format = format;
        self
    }

    pub fn model_path(&self, name: &str) -> PathBuf {
        self.root.join(&self.layout.models).join(format!("{name}.onnx"))
    }

    pub fn reference_dir(&self, name: &str) -> PathBuf {
        self.root.join(&self.layout.references).join(name)
    }

    pub fn reference_file(&self, name: &str) -> PathBuf {
        self.root
            .join(&self.layout.references)
            .join(format!("{name}_reference.out"))
    }

    pub fn driver_path(&self, name: &str) -> PathBuf {
        self.root
            .join(&self.layout.drivers)
            .join(format!("{name}_wrapper.dml"))
    }

    pub fn inputs_dir(&self, name: &str) -> PathBuf {
        self.root.join(&self.layout.inputs).join(name)
    }

    /// Every case with a model on disk, sorted by name.
    pub fn case_names(&self) -> Result<Vec<String>, FixtureError> {
        let models_dir = self.root.join(&self.layout.models);
        let mut names = Vec::new();
        for path in list_dir(&models_dir)? {
            if path.extension().is_some_and(|ext| ext == "onnx")
                && let Some(stem) = path.file_stem()
            {
                names.push(stem.to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_expected(&self, name: &str) -> Result<BTreeMap<String, Matrix>, FixtureError> {
        let dir = self.reference_dir(name);
        if dir.is_dir() {
            let expected = read_named_matrices(&dir, self.format)?;
            if expected.is_empty() {
                return Err(FixtureError::EmptyExpected(dir));
            }
            return Ok(expected);
        }
        let file = self.reference_file(name);
        let matrix = dml_io::read_matrix(&file, self.format)?;
        Ok(BTreeMap::from([(SINGLE_OUTPUT_NAME.to_string(), matrix)]))
    }
}

fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, FixtureError> {
    let io_err = |source| FixtureError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        paths.push(entry.map_err(io_err)?.path());
    }
    paths.sort();
    Ok(paths)
}

/// Reads every tensor or matrix file in `dir`, keyed by tensor name (for
/// `.pb` files that carry one) or by file stem.
fn read_named_matrices(
    dir: &Path,
    format: MatrixFormat,
) -> Result<BTreeMap<String, Matrix>, FixtureError> {
    let mut matrices = BTreeMap::new();
    for path in list_dir(dir)? {
        let Some(stem) = path.file_stem().map(|x| x.to_string_lossy().to_string()) else {
            continue;
        };
        if stem.starts_with('.') || dml_io::is_metadata_file(&path) {
            continue;
        }
        if path.extension().is_some_and(|ext| ext == "pb") {
            let bytes = fs::read(&path).map_err(|source| FixtureError::Io {
                path: path.clone(),
                source,
            })?;
            let tensor = DecodedTensor::decode(&bytes)
                .and_then(|tensor| Ok((tensor.to_matrix()?, tensor.name)))
                .map_err(|source| FixtureError::Tensor {
                    path: path.clone(),
                    source,
                })?;
            let (matrix, tensor_name) = tensor;
            let name = if tensor_name.is_empty() { stem } else { tensor_name };
            matrices.insert(name, matrix);
        } else {
            matrices.insert(stem, dml_io::read_matrix(&path, format)?);
        }
    }
    Ok(matrices)
}

impl FixtureStore for DirectoryFixtureStore {
    fn locate(&self, name: &str) -> Result<Fixture, FixtureError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(FixtureError::InvalidName(name.to_string()));
        }

        // Both halves of the pair must exist before anything is decoded
        let model_path = self.model_path(name);
        if !model_path.is_file() {
            return Err(FixtureError::Missing {
                what: "ONNX model",
                location: model_path.display().to_string(),
            });
        }
        if !self.reference_dir(name).is_dir() && !self.reference_file(name).exists() {
            return Err(FixtureError::Missing {
                what: "expected output",
                location: format!(
                    "{} or {}",
                    self.reference_dir(name).display(),
                    self.reference_file(name).display()
                ),
            });
        }

        let bytes = fs::read(&model_path).map_err(|source| FixtureError::Io {
            path: model_path.clone(),
            source,
        })?;
        let model = OnnxModel::from_bytes(bytes)
            .map_err(|source| FixtureError::Model {
                path: model_path.clone(),
                source,
            })?
            .with_path(&model_path);

        let expected = self.read_expected(name)?;

        let driver_path = self.driver_path(name);
        let driver = if driver_path.is_file() {
            Some(fs::read_to_string(&driver_path).map_err(|source| FixtureError::Io {
                path: driver_path.clone(),
                source,
            })?)
        } else {
            None
        };

        let inputs_dir = self.inputs_dir(name);
        let inputs = if inputs_dir.is_dir() {
            read_named_matrices(&inputs_dir, self.format)?
        } else {
            BTreeMap::new()
        };

        log::debug!(
            "Located {name}: {} expected output(s), {} input(s), driver: {}",
            expected.len(),
            inputs.len(),
            driver.is_some()
        );

        Ok(Fixture {
            name: name.to_string(),
            model,
            driver,
            inputs,
            expected,
        })
    }
}
