//! Dense host tensors and element data types.

use std::fmt;

use crate::error::IrError;
use crate::shape::TensorShape;

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum DataType {
    /// 32-bit float.
    Float,
    /// 32-bit signed integer.
    Int,
}

impl DataType {
    /// Width of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        4
    }

    /// Lowercase type name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Int => "int",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element storage of a [`Tensor`].
#[derive(Clone, Debug, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Int(v) => v.len(),
        }
    }
}

/// A dense row-major tensor living in host memory.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: TensorShape,
    data: TensorData,
}

impl Tensor {
    /// Creates a tensor, checking that the data fills the shape.
    pub fn new(shape: TensorShape, data: TensorData) -> Result<Self, IrError> {
        if data.len() != shape.length() {
            return Err(IrError::DataLength {
                len: data.len(),
                shape: shape.to_string(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Float tensor from dimensions and values.
    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> Result<Self, IrError> {
        Self::new(TensorShape::new(dims)?, TensorData::Float(values))
    }

    /// Int tensor from dimensions and values.
    pub fn from_i32(dims: &[usize], values: Vec<i32>) -> Result<Self, IrError> {
        Self::new(TensorShape::new(dims)?, TensorData::Int(values))
    }

    /// Rank-0 float tensor.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            shape: TensorShape::scalar(),
            data: TensorData::Float(vec![value]),
        }
    }

    /// Tensor of the given type filled with zeros.
    pub fn zeros(data_type: DataType, shape: TensorShape) -> Self {
        let data = match data_type {
            DataType::Float => TensorData::Float(vec![0.0; shape.length()]),
            DataType::Int => TensorData::Int(vec![0; shape.length()]),
        };
        Self { shape, data }
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn data_type(&self) -> DataType {
        match self.data {
            TensorData::Float(_) => DataType::Float,
            TensorData::Int(_) => DataType::Int,
        }
    }

    /// Float elements, if this is a float tensor.
    pub fn as_f32(&self) -> Result<&[f32], IrError> {
        match &self.data {
            TensorData::Float(v) => Ok(v),
            TensorData::Int(_) => Err(IrError::DataType {
                expected: "float",
                found: "int",
            }),
        }
    }

    /// Int elements, if this is an int tensor.
    pub fn as_i32(&self) -> Result<&[i32], IrError> {
        match &self.data {
            TensorData::Int(v) => Ok(v),
            TensorData::Float(_) => Err(IrError::DataType {
                expected: "int",
                found: "float",
            }),
        }
    }

    /// Elements converted to f32 regardless of storage type.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::Float(v) => v.clone(),
            TensorData::Int(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Same data viewed under a new shape of equal length.
    pub fn reshaped(&self, shape: TensorShape) -> Result<Self, IrError> {
        Self::new(shape, self.data.clone())
    }

    /// Little-endian byte image of the elements.
    pub fn to_bytes(&self) -> Vec<u8> {
        match &self.data {
            TensorData::Float(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::Int(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Decodes a little-endian byte image.
    pub fn from_bytes(
        data_type: DataType,
        shape: TensorShape,
        bytes: &[u8],
    ) -> Result<Self, IrError> {
        if bytes.len() != shape.length() * data_type.size_in_bytes() {
            return Err(IrError::DataLength {
                len: bytes.len() / data_type.size_in_bytes(),
                shape: shape.to_string(),
            });
        }
        let words = bytes
            .chunks_exact(4)
            .map(|c| [c[0], c[1], c[2], c[3]]);
        let data = match data_type {
            DataType::Float => TensorData::Float(words.map(f32::from_le_bytes).collect()),
            DataType::Int => TensorData::Int(words.map(i32::from_le_bytes).collect()),
        };
        Self::new(shape, data)
    }
}
