use crate::dtype::DType;
use crate::onnx::tensor_shape_proto::dimension;
use crate::onnx::{ModelProto, ValueInfoProto, type_proto};
use prost::{DecodeError, Message};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error(transparent)]
    DecodeError(#[from] DecodeError),
    #[error("Model has no graph")]
    MissingGraph,
}

/// Graph input or output as declared in the model signature.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSignature {
    pub name: String,
    pub dtype: Option<DType>,
    /// `None` entries are symbolic dimensions.
    pub shape: Option<Vec<Option<i64>>>,
}

impl From<&ValueInfoProto> for ValueSignature {
    fn from(value: &ValueInfoProto) -> Self {
        let tensor_type = value.r#type.as_ref().and_then(|t| match &t.value {
            Some(type_proto::Value::TensorType(tensor)) => Some(tensor),
            None => None,
        });
        let dtype = tensor_type.and_then(|t| DType::from_onnx_id(t.elem_type).ok());
        let shape = tensor_type.and_then(|t| t.shape.as_ref()).map(|shape| {
            shape
                .dim
                .iter()
                .map(|dim| match &dim.value {
                    Some(dimension::Value::DimValue(x)) => Some(*x),
                    _ => None,
                })
                .collect()
        });
        ValueSignature {
            name: value.name.clone(),
            dtype,
            shape,
        }
    }
}

/// The model handle handed to converters: the raw bytes exactly as stored in
/// the fixture plus the decoded proto for inspection.
#[derive(Debug, Clone)]
pub struct OnnxModel {
    path: Option<PathBuf>,
    bytes: Vec<u8>,
    proto: ModelProto,
}

impl OnnxModel {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ModelError> {
        let proto = ModelProto::decode(bytes.as_slice())?;
        if proto.graph.is_none() {
            return Err(ModelError::MissingGraph);
        }
        Ok(Self {
            path: None,
            bytes,
            proto,
        })
    }

    pub fn from_proto(proto: ModelProto) -> Result<Self, ModelError> {
        let bytes = proto.encode_to_vec();
        Self::from_bytes(bytes)
    }

    pub fn with_path(mut self, path: &Path) -> Self {
        self.path = Some(path.to_path_buf());
        self
    }

    /// Where the model was loaded from, when it came from disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn proto(&self) -> &ModelProto {
        &self.proto
    }

    pub fn graph_name(&self) -> &str {
        self.proto.graph.as_ref().map(|g| g.name.as_str()).unwrap_or_default()
    }

    pub fn producer(&self) -> &str {
        &self.proto.producer_name
    }

    /// Opset version of the default domain.
    pub fn opset_version(&self) -> Option<i64> {
        self.proto
            .opset_import
            .iter()
            .find(|x| x.domain.is_empty() || x.domain == "ai.onnx")
            .map(|x| x.version)
    }

    /// Graph inputs that are not initializers.
    pub fn inputs(&self) -> Vec<ValueSignature> {
        let Some(graph) = &self.proto.graph else {
            return vec![];
        };
        graph
            .input
            .iter()
            .filter(|input| !graph.initializer.iter().any(|init| init.name == input.name))
            .map(ValueSignature::from)
            .collect()
    }

    pub fn outputs(&self) -> Vec<ValueSignature> {
        self.proto
            .graph
            .iter()
            .flat_map(|graph| graph.output.iter().map(ValueSignature::from))
            .collect()
    }

    pub fn operators(&self) -> Vec<&str> {
        self.proto
            .graph
            .iter()
            .flat_map(|graph| graph.node.iter().map(|node| node.op_type.as_str()))
            .collect()
    }
}
