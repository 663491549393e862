//! Error types for the lumen IR.

/// Errors that can occur when constructing or querying a model.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A shape exceeded the maximum supported rank.
    #[error("rank {rank} exceeds the maximum supported rank of {max}")]
    RankOverflow { rank: usize, max: usize },

    /// The element count of a shape does not fit in `usize`.
    #[error("element count of shape {0} overflows")]
    LengthOverflow(String),

    /// An axis was out of range for a shape.
    #[error("axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: isize, rank: usize },

    /// Two shapes could not be combined.
    #[error("incompatible shapes {lhs} and {rhs}")]
    IncompatibleShapes { lhs: String, rhs: String },

    /// A name was referenced before it was defined.
    #[error("layer '{layer}' references undefined name '{name}'")]
    UndefinedName { layer: String, name: String },

    /// A name was defined twice.
    #[error("name '{0}' is already defined")]
    DuplicateName(String),

    /// A constant lookup failed.
    #[error("no constant named '{0}'")]
    UnknownConstant(String),

    /// A weight region falls outside its chunk.
    #[error("weight range {offset}..{end} out of bounds for chunk {chunk} (size {size})")]
    WeightOutOfBounds {
        chunk: usize,
        offset: usize,
        end: usize,
        size: usize,
    },

    /// Data length does not match the shape.
    #[error("data length {len} does not match shape {shape}")]
    DataLength { len: usize, shape: String },

    /// A tensor had the wrong element type for the operation.
    #[error("expected {expected} data, found {found}")]
    DataType {
        expected: &'static str,
        found: &'static str,
    },

    /// An einsum equation could not be parsed.
    #[error("invalid einsum equation '{equation}': {reason}")]
    InvalidEinsum { equation: String, reason: String },
}
