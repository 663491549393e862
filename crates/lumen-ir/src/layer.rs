//! Layers: the operator nodes of a model graph.

use std::hash::{DefaultHasher, Hash, Hasher};

/// Bitflags attached to a layer.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub struct LayerFlags(u32);

impl LayerFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Never fuse or remove this layer, even if otherwise eligible.
    pub const PRESERVE: Self = Self(1);

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit pattern.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from a raw bit pattern, dropping unknown bits.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::PRESERVE.0)
    }
}

impl std::ops::BitOr for LayerFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for LayerFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Activation applied after a layer's main computation.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq)]
pub enum Activation {
    #[default]
    None,
    Relu,
}

/// The operation a layer performs, together with its attributes.
///
/// Input conventions are documented per variant; an empty input name marks
/// an absent optional input.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Pass-through of input 0.
    Identity,
    /// Broadcasting elementwise binary ops.
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    /// Elementwise unary ops.
    Neg,
    Sqrt,
    Reciprocal,
    Exp,
    Erf,
    Tanh,
    Sigmoid,
    Relu,
    /// `x * sigmoid(x)`.
    Swish,
    /// `0.5 * x * (1 + erf(x / sqrt(2)))`.
    Gelu,
    /// `x * scale + bias` with scalar attributes.
    ScalarMad { scale: f32, bias: f32 },
    /// Batched matrix product of inputs 0 and 1.
    MatMul,
    /// `x @ weights + bias`; inputs `[x, weights (K, N), bias (N)]`.
    Dense { activation: Activation },
    /// 2D NCHW convolution; inputs `[x, weights (M, C/group, kH, kW), bias?]`.
    Conv {
        strides: [usize; 2],
        pads: [usize; 4],
        dilations: [usize; 2],
        group: usize,
        activation: Activation,
    },
    /// Inputs `[x, scale, bias, mean, variance]`, channels on axis 1.
    BatchNormalization { epsilon: f32 },
    /// `x * scale + bias`; inputs `[x, scale, bias]`, channels on axis 1.
    ScaleBias,
    /// Normalizes over the last axis; inputs `[x, scale, bias]`.
    LayerNormalization { epsilon: f32 },
    Softmax { axis: isize },
    ReduceMean { axes: Vec<isize>, keep_dims: bool },
    ReduceSum { axes: Vec<isize>, keep_dims: bool },
    /// Inputs `[x, shape]`; `0` copies the input dim unless `allow_zero`,
    /// `-1` is inferred.
    Reshape { allow_zero: bool },
    /// Reverses the axes when `perm` is `None`.
    Transpose { perm: Option<Vec<usize>> },
    Concat { axis: isize },
    /// Splits input 0 along `axis`; produces one output per entry in
    /// `sizes`.
    Split { axis: isize, sizes: Vec<usize> },
    /// Int tensor holding the shape of input 0.
    Shape,
    /// Inputs `[data, indices]`.
    Gather { axis: isize },
    /// Inputs `[x, shape]`, broadcasting `x` to `shape`.
    Expand,
    /// Float tensor of the shape given by input 0, filled with `value`.
    ConstantOfShape { value: f32 },
    /// Inputs are the einsum operands.
    Einsum { equation: String },
    /// Samples a normal distribution; no inputs.
    RandomNormal {
        shape: Vec<usize>,
        mean: f32,
        scale: f32,
        seed: Option<u64>,
    },
    /// `softmax(q @ k^T * scale) @ v`; inputs `[q, k, v]`.
    ScaledDotProductAttention { scale: f32 },
}

impl Op {
    /// Operator type name.
    pub fn op_type(&self) -> &'static str {
        match self {
            Self::Identity => "Identity",
            Self::Add => "Add",
            Self::Sub => "Sub",
            Self::Mul => "Mul",
            Self::Div => "Div",
            Self::Pow => "Pow",
            Self::Neg => "Neg",
            Self::Sqrt => "Sqrt",
            Self::Reciprocal => "Reciprocal",
            Self::Exp => "Exp",
            Self::Erf => "Erf",
            Self::Tanh => "Tanh",
            Self::Sigmoid => "Sigmoid",
            Self::Relu => "Relu",
            Self::Swish => "Swish",
            Self::Gelu => "Gelu",
            Self::ScalarMad { .. } => "ScalarMad",
            Self::MatMul => "MatMul",
            Self::Dense { .. } => "Dense",
            Self::Conv { .. } => "Conv",
            Self::BatchNormalization { .. } => "BatchNormalization",
            Self::ScaleBias => "ScaleBias",
            Self::LayerNormalization { .. } => "LayerNormalization",
            Self::Softmax { .. } => "Softmax",
            Self::ReduceMean { .. } => "ReduceMean",
            Self::ReduceSum { .. } => "ReduceSum",
            Self::Reshape { .. } => "Reshape",
            Self::Transpose { .. } => "Transpose",
            Self::Concat { .. } => "Concat",
            Self::Split { .. } => "Split",
            Self::Shape => "Shape",
            Self::Gather { .. } => "Gather",
            Self::Expand => "Expand",
            Self::ConstantOfShape { .. } => "ConstantOfShape",
            Self::Einsum { .. } => "Einsum",
            Self::RandomNormal { .. } => "RandomNormal",
            Self::ScaledDotProductAttention { .. } => "ScaledDotProductAttention",
        }
    }

    /// The fused activation slot, for ops that have one.
    pub fn activation(&self) -> Option<Activation> {
        match self {
            Self::Dense { activation } | Self::Conv { activation, .. } => Some(*activation),
            _ => None,
        }
    }

    /// Sets the fused activation. Returns `false` if the op has no slot.
    pub fn set_activation(&mut self, value: Activation) -> bool {
        match self {
            Self::Dense { activation } | Self::Conv { activation, .. } => {
                *activation = value;
                true
            }
            _ => false,
        }
    }

    /// Inputs whose values must be readable on the host when the layer
    /// executes.
    pub fn cpu_read_inputs(&self) -> &'static [usize] {
        match self {
            Self::Reshape { .. } | Self::Expand => &[1],
            Self::ConstantOfShape { .. } => &[0],
            _ => &[],
        }
    }

    /// Inputs of which only the static shape is used.
    pub fn no_data_dependency_inputs(&self) -> &'static [usize] {
        match self {
            Self::Shape => &[0],
            _ => &[],
        }
    }

    /// `true` if two executions with equal inputs may produce different
    /// outputs.
    pub fn is_non_deterministic(&self) -> bool {
        matches!(self, Self::RandomNormal { .. })
    }

    /// `true` for binary ops whose operands may be swapped.
    pub fn is_commutative(&self) -> bool {
        matches!(self, Self::Add | Self::Mul)
    }

    /// `true` for the broadcasting elementwise binary ops.
    pub fn is_broadcast_binary(&self) -> bool {
        matches!(
            self,
            Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Pow
        )
    }

    /// Number of outputs the op produces.
    pub fn num_outputs(&self) -> usize {
        match self {
            Self::Split { sizes, .. } => sizes.len().max(1),
            _ => 1,
        }
    }
}

/// A node of the model graph.
///
/// The primary output is named `name`; multi-output layers list their
/// further outputs, in order, in `outputs`.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub flags: LayerFlags,
    pub op: Op,
}

impl Layer {
    /// Creates a single-output layer.
    pub fn new(name: impl Into<String>, op: Op, inputs: &[&str]) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: Vec::new(),
            flags: LayerFlags::NONE,
            op,
        }
    }

    /// Sets the additional output names.
    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Adds flags.
    pub fn with_flags(mut self, flags: LayerFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// All names this layer defines, primary output first.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.outputs.iter().map(String::as_str))
    }

    /// Present (non-empty) inputs with their slot index.
    pub fn present_inputs(&self) -> impl Iterator<Item = (usize, &str)> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(i, name)| (i, name.as_str()))
    }

    /// Input name at `index`, `None` if absent.
    pub fn input(&self, index: usize) -> Option<&str> {
        self.inputs
            .get(index)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn is_preserved(&self) -> bool {
        self.flags.contains(LayerFlags::PRESERVE)
    }

    /// Structural equality: same op and attributes, same ordered inputs and
    /// the same number of outputs. Names and flags are metadata.
    pub fn structurally_equal(&self, other: &Self) -> bool {
        self.op == other.op
            && self.inputs == other.inputs
            && self.outputs.len() == other.outputs.len()
    }

    /// Cheap hash over op type and inputs used to bucket candidates for
    /// [`structurally_equal`](Self::structurally_equal).
    pub fn weak_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.op.op_type().hash(&mut hasher);
        self.inputs.hash(&mut hasher);
        hasher.finish()
    }
}
