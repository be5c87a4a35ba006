use ndarray::array;
use onnx_dml_harness::converter::{Converter, ConverterError};
use onnx_dml_harness::dml_io::{self, MatrixFormat};
use onnx_dml_harness::model::OnnxModel;
use onnx_dml_harness::onnx::{
    GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorShapeProto, TypeProto,
    ValueInfoProto, tensor_proto, tensor_shape_proto, type_proto,
};
use onnx_dml_harness::runtime::{ExecutionRequest, RuntimeError, ScriptRuntime, collect_outputs};
use onnx_dml_harness::tensor::{Matrix, matrix_to_proto};
use prost::Message;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

pub mod runner;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn sample_input() -> Matrix {
    array![[1.0, -2.0, 3.5], [0.0, 4.25, -0.125]]
}

fn tensor_value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: tensor_proto::DataType::Double as i32,
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|x| tensor_shape_proto::Dimension {
                            value: Some(tensor_shape_proto::dimension::Value::DimValue(*x)),
                            ..Default::default()
                        })
                        .collect(),
                }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Single `Identity` node from `X` to `Y`.
pub fn identity_model() -> ModelProto {
    ModelProto {
        ir_version: 8,
        producer_name: "harness-tests".to_string(),
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        graph: Some(GraphProto {
            name: "identity".to_string(),
            node: vec![NodeProto {
                input: vec!["X".to_string()],
                output: vec!["Y".to_string()],
                op_type: "Identity".to_string(),
                ..Default::default()
            }],
            input: vec![tensor_value_info("X", &[2, 3])],
            output: vec![tensor_value_info("Y", &[2, 3])],
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Writes a complete identity fixture named `name` under `root`, expecting `expected` for `Y`.
pub fn write_identity_fixture(root: &Path, name: &str, expected: &Matrix) {
    let models = root.join("test_models");
    fs::create_dir_all(&models).unwrap();
    fs::write(models.join(format!("{name}.onnx")), identity_model().encode_to_vec()).unwrap();

    let inputs = root.join("test_inputs").join(name);
    fs::create_dir_all(&inputs).unwrap();
    fs::write(inputs.join("X.pb"), matrix_to_proto("X", &sample_input()).encode_to_vec()).unwrap();

    let references = root.join("output_reference").join(name);
    fs::create_dir_all(&references).unwrap();
    dml_io::write_matrix(&references.join("Y.out"), expected, MatrixFormat::Text).unwrap();
}

pub fn write_driver(root: &Path, name: &str, contents: &str) {
    let drivers = root.join("dml_wrapper");
    fs::create_dir_all(&drivers).unwrap();
    fs::write(drivers.join(format!("{name}_wrapper.dml")), contents).unwrap();
}

/// Emits a fixed script and counts how often it was asked to.
#[derive(Default)]
pub struct CountingConverter {
    pub calls: AtomicUsize,
}

impl CountingConverter {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for CountingConverter {
    fn onnx_to_script(&self, model: &OnnxModel) -> Result<String, ConverterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!(
            "gen_{}= function(Matrix[Double] X) return (Matrix[Double] Y) {{\n  Y = X\n}}\n",
            model.graph_name()
        ))
    }
}

pub struct FailingConverter;

impl Converter for FailingConverter {
    fn onnx_to_script(&self, _model: &OnnxModel) -> Result<String, ConverterError> {
        Err(anyhow::anyhow!("operator Dropout is not supported").into())
    }
}

pub struct BlankConverter;

impl Converter for BlankConverter {
    fn onnx_to_script(&self, _model: &OnnxModel) -> Result<String, ConverterError> {
        Ok("  \n\t".to_string())
    }
}

/// Evaluates the identity graph: copies the `X` input to the `Y` output through
/// real matrix files.
pub struct CopyRuntime;

impl ScriptRuntime for CopyRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        assert!(request.script.is_file());
        let input = request
            .inputs
            .get("X")
            .ok_or_else(|| anyhow::anyhow!("no input X"))?;
        let matrix = dml_io::read_matrix(input, MatrixFormat::Text)?;
        dml_io::write_matrix(&request.output_dir.join("Y.out"), &matrix, MatrixFormat::Text)?;
        collect_outputs(request.output_dir, MatrixFormat::Text)
    }
}

/// Writes the given outputs regardless of the script.
pub struct FixedRuntime(pub BTreeMap<String, Matrix>);

impl ScriptRuntime for FixedRuntime {
    fn execute(&self, request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        for (name, matrix) in &self.0 {
            dml_io::write_matrix(&request.output_dir.join(format!("{name}.csv")), matrix, MatrixFormat::Csv)?;
        }
        collect_outputs(request.output_dir, MatrixFormat::Text)
    }
}

pub struct CrashingRuntime;

impl ScriptRuntime for CrashingRuntime {
    fn execute(&self, _request: &ExecutionRequest) -> Result<BTreeMap<String, Matrix>, RuntimeError> {
        Err(RuntimeError::Failed {
            status: "exit status: 1".to_string(),
            stderr: "Exception in thread \"main\"".to_string(),
        })
    }
}
