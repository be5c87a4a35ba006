use crate::onnx;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DTypeError {
    #[error("The onnx dtype {0:?} is not supported")]
    UnsupportedONNXDtype(onnx::tensor_proto::DataType),
    #[error("Unknown onnx dtype id {0}")]
    UnknownONNXDtype(i32),
}

#[derive(
    Copy, Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Serialize, Deserialize, strum_macros::Display,
)]
pub enum DType {
    #[strum(serialize = "Float64")]
    F64,
    #[strum(serialize = "Float32")]
    F32,
    #[strum(serialize = "BFloat16")]
    BF16,
    #[strum(serialize = "Float16")]
    F16,
    #[strum(serialize = "UInt64")]
    U64,
    #[strum(serialize = "Int64")]
    I64,
    #[strum(serialize = "UInt32")]
    U32,
    #[strum(serialize = "Int32")]
    I32,
    #[strum(serialize = "UInt16")]
    U16,
    #[strum(serialize = "Int16")]
    I16,
    #[strum(serialize = "UInt8")]
    U8,
    #[strum(serialize = "Int8")]
    I8,
    #[strum(serialize = "Bool")]
    BOOL,
}

impl DType {
    /// Bytes per element in `raw_data`.
    pub fn size(&self) -> usize {
        match self {
            DType::F64 | DType::I64 | DType::U64 => 8,
            DType::F32 | DType::I32 | DType::U32 => 4,
            DType::BF16 | DType::F16 | DType::I16 | DType::U16 => 2,
            DType::I8 | DType::U8 | DType::BOOL => 1,
        }
    }

    /// Resolves the raw `data_type` field of a `TensorProto` or `TypeProto.Tensor`.
    pub fn from_onnx_id(id: i32) -> Result<Self, DTypeError> {
        let onnx_dtype =
            onnx::tensor_proto::DataType::try_from(id).map_err(|_| DTypeError::UnknownONNXDtype(id))?;
        DType::try_from(onnx_dtype)
    }
}

impl TryFrom<onnx::tensor_proto::DataType> for DType {
    type Error = DTypeError;
    fn try_from(onnx_dtype: onnx::tensor_proto::DataType) -> Result<Self, DTypeError> {
        Ok(match onnx_dtype {
            onnx::tensor_proto::DataType::Double => DType::F64,
            onnx::tensor_proto::DataType::Float => DType::F32,
            onnx::tensor_proto::DataType::Bfloat16 => DType::BF16,
            onnx::tensor_proto::DataType::Float16 => DType::F16,
            onnx::tensor_proto::DataType::Int64 => DType::I64,
            onnx::tensor_proto::DataType::Int32 => DType::I32,
            onnx::tensor_proto::DataType::Uint64 => DType::U64,
            onnx::tensor_proto::DataType::Uint32 => DType::U32,
            onnx::tensor_proto::DataType::Uint16 => DType::U16,
            onnx::tensor_proto::DataType::Int16 => DType::I16,
            onnx::tensor_proto::DataType::Uint8 => DType::U8,
            onnx::tensor_proto::DataType::Int8 => DType::I8,
            onnx::tensor_proto::DataType::Bool => DType::BOOL,
            _ => Err(DTypeError::UnsupportedONNXDtype(onnx_dtype))?,
        })
    }
}
