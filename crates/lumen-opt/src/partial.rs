//! Partially known tensors.
//!
//! A [`PartialTensor`] pairs a symbolic shape with optional per-element
//! knowledge. Elements are only tracked for small tensors of fully known
//! shape, which is enough to fold shape arithmetic (`Shape -> Gather ->
//! Concat -> Reshape`) without running anything.

use std::fmt;

use lumen_ir::{DataType, SymbolicDim, SymbolicTensorShape, Tensor, TensorData, TensorShape};

/// Largest tensor whose elements are tracked.
pub const MAX_TRACKED_ELEMENTS: usize = 4096;

/// What is statically known about one element.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PartialElement {
    Unknown,
    Int(i32),
    Float(f32),
    /// An integer equal to a named symbolic dimension.
    Param(char),
}

impl PartialElement {
    pub fn is_known(self) -> bool {
        matches!(self, Self::Int(_) | Self::Float(_))
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(i64::from(v)),
            Self::Float(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_f32(self) -> Option<f32> {
        match self {
            Self::Int(v) => Some(v as f32),
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    /// The element as a dimension: known integers and params carry over.
    pub fn to_dim(self) -> SymbolicDim {
        match self {
            Self::Int(v) if v >= 0 => SymbolicDim::Value(v as usize),
            Self::Param(c) => SymbolicDim::Param(c),
            _ => SymbolicDim::Unknown,
        }
    }

    /// A dimension as an int element.
    pub fn from_dim(dim: SymbolicDim) -> Self {
        match dim {
            SymbolicDim::Value(v) => i32::try_from(v).map_or(Self::Unknown, Self::Int),
            SymbolicDim::Param(c) => Self::Param(c),
            SymbolicDim::Unknown => Self::Unknown,
        }
    }
}

impl fmt::Display for PartialElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("?"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Param(c) => write!(f, "{c}"),
        }
    }
}

/// Statically known facts about a tensor value.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialTensor {
    data_type: DataType,
    shape: SymbolicTensorShape,
    elements: Option<Vec<PartialElement>>,
}

impl PartialTensor {
    /// Nothing is known except the element type.
    pub fn unknown(data_type: DataType) -> Self {
        Self {
            data_type,
            shape: SymbolicTensorShape::unknown_rank(),
            elements: None,
        }
    }

    /// Known shape, unknown data.
    pub fn from_shape(data_type: DataType, shape: SymbolicTensorShape) -> Self {
        Self {
            data_type,
            shape,
            elements: None,
        }
    }

    /// Known shape with per-element knowledge. Elements are dropped when
    /// the shape is not fully known, the count does not match, or the
    /// tensor is too large to track.
    pub fn with_elements(
        data_type: DataType,
        shape: SymbolicTensorShape,
        elements: Vec<PartialElement>,
    ) -> Self {
        let tracked = shape
            .to_shape()
            .is_some_and(|s| s.length() == elements.len() && s.length() <= MAX_TRACKED_ELEMENTS);
        Self {
            data_type,
            shape,
            elements: tracked.then_some(elements),
        }
    }

    /// Fully known tensor.
    pub fn from_tensor(tensor: &Tensor) -> Self {
        let elements = match tensor.data() {
            TensorData::Float(v) => v.iter().map(|&x| PartialElement::Float(x)).collect(),
            TensorData::Int(v) => v.iter().map(|&x| PartialElement::Int(x)).collect(),
        };
        Self::with_elements(
            tensor.data_type(),
            SymbolicTensorShape::from(*tensor.shape()),
            elements,
        )
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn shape(&self) -> &SymbolicTensorShape {
        &self.shape
    }

    /// Per-element knowledge, if tracked.
    pub fn elements(&self) -> Option<&[PartialElement]> {
        self.elements.as_deref()
    }

    /// Concrete shape, if every dimension is a known value.
    pub fn static_shape(&self) -> Option<TensorShape> {
        self.shape.to_shape()
    }

    /// `true` only if every element is statically known.
    pub fn is_fully_known(&self) -> bool {
        self.elements
            .as_ref()
            .is_some_and(|e| e.iter().all(|x| x.is_known()))
    }

    /// Materializes a fully known tensor.
    pub fn to_tensor(&self) -> Option<Tensor> {
        if !self.is_fully_known() {
            return None;
        }
        let shape = self.static_shape()?;
        let elements = self.elements.as_ref()?;
        let data = match self.data_type {
            DataType::Float => TensorData::Float(elements.iter().filter_map(|e| e.as_f32()).collect()),
            DataType::Int => TensorData::Int(
                elements
                    .iter()
                    .filter_map(|e| e.as_i64())
                    .map(|v| v as i32)
                    .collect(),
            ),
        };
        Tensor::new(shape, data).ok()
    }

    /// Reads a 1-D shape-like tensor as symbolic dimensions.
    pub fn as_dims(&self) -> Option<Vec<SymbolicDim>> {
        if let Some(elements) = &self.elements {
            return Some(elements.iter().map(|e| e.to_dim()).collect());
        }
        match self.shape.dims() {
            Some([SymbolicDim::Value(n)]) => Some(vec![SymbolicDim::Unknown; *n]),
            _ => None,
        }
    }
}

impl fmt::Display for PartialTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.data_type, self.shape)?;
        if let Some(elements) = &self.elements {
            let shown: Vec<String> = elements.iter().take(8).map(ToString::to_string).collect();
            write!(f, " [{}", shown.join(", "))?;
            if elements.len() > 8 {
                f.write_str(", ...")?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}
