use crate::dtype::{DType, DTypeError};
use crate::onnx::TensorProto;
use half::{bf16, f16};
use ndarray::{Array2, ArrayD, IxDyn};
use num_traits::ToPrimitive;
use prost::Message;

/// DML matrices are always 2-D and double precision.
pub type Matrix = Array2<f64>;

#[derive(Debug, thiserror::Error)]
pub enum TensorDecodingError {
    #[error(transparent)]
    DTypeError(#[from] DTypeError),
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("Protobuf decoding error: {0}")]
    ProtobufDecodeError(#[from] prost::DecodeError),
    #[error("Negative dimension {0}")]
    NegativeDimension(i64),
    #[error("Unsupported dtype {0} in {1} field")]
    UnsupportedField(DType, &'static str),
    #[error("Raw data of {len} bytes does not hold {count} {dtype} elements")]
    RawDataLength {
        len: usize,
        count: usize,
        dtype: DType,
    },
    #[error("Shape {0:?} has too many elements")]
    TooManyElements(Vec<usize>),
    #[error("Tensor \"{0}\" carries no data field")]
    MissingData(String),
}

/// A `TensorProto` widened to `f64`, keeping the original element type for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTensor {
    pub name: String,
    pub dtype: DType,
    pub values: ArrayD<f64>,
}

impl DecodedTensor {
    pub fn decode(bytes: &[u8]) -> Result<Self, TensorDecodingError> {
        let proto = TensorProto::decode(bytes)?;
        Self::try_from(&proto)
    }

    pub fn shape(&self) -> &[usize] {
        self.values.shape()
    }

    /// Lays the tensor out the way the converter hands tensors to DML:
    /// scalars become 1x1, vectors become column vectors and higher ranks keep
    /// their leading dimension as rows, flattening the rest row-major.
    pub fn to_matrix(&self) -> Result<Matrix, TensorDecodingError> {
        let shape = self.shape();
        let (rows, cols) = match shape.len() {
            0 => (1, 1),
            1 => (shape[0], 1),
            _ => (shape[0], element_count(&shape[1..])?),
        };
        Ok(self
            .values
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((rows, cols))?)
    }
}

fn element_count(shape: &[usize]) -> Result<usize, TensorDecodingError> {
    shape
        .iter()
        .try_fold(1usize, |acc, x| acc.checked_mul(*x))
        .filter(|count| *count <= isize::MAX as usize)
        .ok_or_else(|| TensorDecodingError::TooManyElements(shape.to_vec()))
}

fn from_raw_data<const N: usize, T: ToPrimitive>(data: &[u8], read: impl Fn([u8; N]) -> T) -> Vec<f64> {
    data.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            read(bytes).to_f64().unwrap_or(f64::NAN)
        })
        .collect()
}

fn widen<T: ToPrimitive>(values: &[T]) -> Vec<f64> {
    values
        .iter()
        .map(|x| x.to_f64().unwrap_or(f64::NAN))
        .collect()
}

impl TryFrom<&TensorProto> for DecodedTensor {
    type Error = TensorDecodingError;

    fn try_from(tensor: &TensorProto) -> Result<Self, Self::Error> {
        let dtype = DType::from_onnx_id(tensor.data_type)?;

        let mut shape = Vec::with_capacity(tensor.dims.len());
        for dim in &tensor.dims {
            shape.push(usize::try_from(*dim).map_err(|_| TensorDecodingError::NegativeDimension(*dim))?);
        }
        let count = element_count(&shape)?;

        let values = if !tensor.raw_data.is_empty() {
            let data = &tensor.raw_data;
            if data.len() % dtype.size() != 0 || data.len() / dtype.size() != count {
                return Err(TensorDecodingError::RawDataLength {
                    len: data.len(),
                    count,
                    dtype,
                });
            }
            match dtype {
                DType::F64 => from_raw_data(data, f64::from_le_bytes),
                DType::F32 => from_raw_data(data, f32::from_le_bytes),
                DType::BF16 => from_raw_data(data, |x| bf16::from_bits(u16::from_le_bytes(x))),
                DType::F16 => from_raw_data(data, |x| f16::from_bits(u16::from_le_bytes(x))),
                DType::I64 => from_raw_data(data, i64::from_le_bytes),
                DType::U64 => from_raw_data(data, u64::from_le_bytes),
                DType::I32 => from_raw_data(data, i32::from_le_bytes),
                DType::U32 => from_raw_data(data, u32::from_le_bytes),
                DType::I16 => from_raw_data(data, i16::from_le_bytes),
                DType::U16 => from_raw_data(data, u16::from_le_bytes),
                DType::I8 => from_raw_data(data, i8::from_le_bytes),
                DType::U8 => from_raw_data(data, u8::from_le_bytes),
                DType::BOOL => from_raw_data(data, |[x]: [u8; 1]| u8::from(x != 0)),
            }
        } else if !tensor.float_data.is_empty() {
            match dtype {
                DType::F32 => widen(&tensor.float_data),
                _ => Err(TensorDecodingError::UnsupportedField(dtype, "float_data"))?,
            }
        } else if !tensor.double_data.is_empty() {
            match dtype {
                DType::F64 => tensor.double_data.clone(),
                _ => Err(TensorDecodingError::UnsupportedField(dtype, "double_data"))?,
            }
        } else if !tensor.int32_data.is_empty() {
            // int32_data also carries the narrow integer types, bool and the 16-bit float bit patterns
            match dtype {
                DType::I32 | DType::I16 | DType::I8 | DType::U16 | DType::U8 => widen(&tensor.int32_data),
                DType::BOOL => tensor.int32_data.iter().map(|x| f64::from(u8::from(*x != 0))).collect(),
                DType::F16 => tensor
                    .int32_data
                    .iter()
                    .map(|x| f16::from_bits(*x as u16).to_f64())
                    .collect(),
                DType::BF16 => tensor
                    .int32_data
                    .iter()
                    .map(|x| bf16::from_bits(*x as u16).to_f64())
                    .collect(),
                _ => Err(TensorDecodingError::UnsupportedField(dtype, "int32_data"))?,
            }
        } else if !tensor.int64_data.is_empty() {
            match dtype {
                DType::I64 => widen(&tensor.int64_data),
                _ => Err(TensorDecodingError::UnsupportedField(dtype, "int64_data"))?,
            }
        } else if !tensor.uint64_data.is_empty() {
            match dtype {
                DType::U64 | DType::U32 => widen(&tensor.uint64_data),
                _ => Err(TensorDecodingError::UnsupportedField(dtype, "uint64_data"))?,
            }
        } else if count == 0 {
            Vec::new()
        } else {
            Err(TensorDecodingError::MissingData(tensor.name.clone()))?
        };

        Ok(DecodedTensor {
            name: tensor.name.clone(),
            dtype,
            values: ArrayD::from_shape_vec(IxDyn(&shape), values)?,
        })
    }
}

/// Packs a matrix as a double `TensorProto` with `raw_data`, the way ONNX
/// exporters write test data sets.
pub fn matrix_to_proto(name: &str, matrix: &Matrix) -> TensorProto {
    let raw_data = matrix
        .iter()
        .flat_map(|x| x.to_le_bytes())
        .collect::<Vec<u8>>();
    TensorProto {
        dims: matrix.shape().iter().map(|x| *x as i64).collect(),
        data_type: crate::onnx::tensor_proto::DataType::Double as i32,
        name: name.to_string(),
        raw_data,
        ..Default::default()
    }
}
