//! Symbolic shapes for partially known tensors.

use std::fmt;

use crate::error::IrError;
use crate::shape::{MAX_RANK, TensorShape, normalize_axis};

/// A dimension that may not be statically known.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum SymbolicDim {
    /// Nothing is known about the size.
    Unknown,
    /// A concrete size.
    Value(usize),
    /// A named runtime parameter such as a batch size.
    Param(char),
}

impl SymbolicDim {
    /// Returns the concrete size, if known.
    pub fn value(self) -> Option<usize> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// `true` if the size is a concrete value.
    pub fn is_value(self) -> bool {
        matches!(self, Self::Value(_))
    }

    /// Broadcasts two dimensions, `None` if they are known to conflict.
    pub fn broadcast(self, other: Self) -> Option<Self> {
        match (self, other) {
            (Self::Value(1), d) | (d, Self::Value(1)) => Some(d),
            (Self::Value(a), Self::Value(b)) if a != b => None,
            (a, b) if a == b => Some(a),
            (Self::Value(v), _) | (_, Self::Value(v)) => Some(Self::Value(v)),
            _ => Some(Self::Unknown),
        }
    }

    /// Merges two descriptions of the same dimension, preferring the more
    /// specific one.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unknown, d) | (d, Self::Unknown) => d,
            (Self::Value(v), _) | (_, Self::Value(v)) => Self::Value(v),
            (a, _) => a,
        }
    }

    /// Product of two dimensions. Overflow yields `Unknown`.
    pub fn mul(self, other: Self) -> Self {
        match (self, other) {
            (Self::Value(0), _) | (_, Self::Value(0)) => Self::Value(0),
            (Self::Value(1), d) | (d, Self::Value(1)) => d,
            (Self::Value(a), Self::Value(b)) => a.checked_mul(b).map_or(Self::Unknown, Self::Value),
            _ => Self::Unknown,
        }
    }

    /// Sum of two dimensions. Overflow yields `Unknown`.
    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (Self::Value(0), d) | (d, Self::Value(0)) => d,
            (Self::Value(a), Self::Value(b)) => a.checked_add(b).map_or(Self::Unknown, Self::Value),
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for SymbolicDim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("?"),
            Self::Value(v) => write!(f, "{v}"),
            Self::Param(c) => write!(f, "{c}"),
        }
    }
}

/// A shape whose rank and dimensions may be partially unknown.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SymbolicTensorShape {
    dims: Option<Vec<SymbolicDim>>,
}

impl SymbolicTensorShape {
    /// A shape of unknown rank.
    pub fn unknown_rank() -> Self {
        Self { dims: None }
    }

    /// A shape of known rank with every dimension unknown.
    pub fn unknown_of_rank(rank: usize) -> Self {
        Self {
            dims: Some(vec![SymbolicDim::Unknown; rank]),
        }
    }

    /// A shape from symbolic dimensions.
    pub fn from_dims(dims: Vec<SymbolicDim>) -> Self {
        Self { dims: Some(dims) }
    }

    /// `None` when the rank itself is unknown.
    pub fn dims(&self) -> Option<&[SymbolicDim]> {
        self.dims.as_deref()
    }

    /// The rank, if known.
    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// Dimension at a (possibly negative) axis.
    pub fn get(&self, axis: isize) -> SymbolicDim {
        match &self.dims {
            Some(dims) => normalize_axis(axis, dims.len())
                .map(|a| dims[a])
                .unwrap_or(SymbolicDim::Unknown),
            None => SymbolicDim::Unknown,
        }
    }

    /// `true` if rank and every dimension are concrete values.
    pub fn is_fully_known(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|d| d.iter().all(|x| x.is_value()))
    }

    /// Converts to a concrete shape if fully known.
    pub fn to_shape(&self) -> Option<TensorShape> {
        let dims: Option<Vec<usize>> = self.dims.as_ref()?.iter().map(|d| d.value()).collect();
        TensorShape::new(&dims?).ok()
    }

    /// Number of elements as a symbolic dimension.
    pub fn length(&self) -> SymbolicDim {
        match &self.dims {
            Some(dims) => dims
                .iter()
                .fold(SymbolicDim::Value(1), |acc, &d| acc.mul(d)),
            None => SymbolicDim::Unknown,
        }
    }

    /// Numpy-style broadcast.
    pub fn broadcast(&self, other: &Self) -> Result<Self, IrError> {
        let (Some(a), Some(b)) = (&self.dims, &other.dims) else {
            return Ok(Self::unknown_rank());
        };
        let rank = a.len().max(b.len());
        let pad = |d: &[SymbolicDim], i: usize| {
            let offset = rank - d.len();
            if i < offset {
                SymbolicDim::Value(1)
            } else {
                d[i - offset]
            }
        };
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let dim = pad(a, i)
                .broadcast(pad(b, i))
                .ok_or_else(|| IrError::IncompatibleShapes {
                    lhs: self.to_string(),
                    rhs: other.to_string(),
                })?;
            out.push(dim);
        }
        Ok(Self::from_dims(out))
    }

    /// Elementwise merge of two descriptions of the same shape.
    pub fn merge(&self, other: &Self) -> Self {
        match (&self.dims, &other.dims) {
            (Some(a), Some(b)) if a.len() == b.len() => {
                Self::from_dims(a.iter().zip(b).map(|(x, y)| x.merge(*y)).collect())
            }
            (Some(_), _) => self.clone(),
            _ => other.clone(),
        }
    }
}

impl From<TensorShape> for SymbolicTensorShape {
    fn from(shape: TensorShape) -> Self {
        Self::from_dims(shape.dims().iter().map(|&d| SymbolicDim::Value(d)).collect())
    }
}

impl fmt::Display for SymbolicTensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(dims) = &self.dims else {
            return f.write_str("(*)");
        };
        debug_assert!(dims.len() <= MAX_RANK);
        f.write_str("(")?;
        for (i, d) in dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str(")")
    }
}
