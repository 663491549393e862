//! Lumen intermediate representation.
//!
//! A name-linked layer graph for neural-network models: inputs, constants
//! backed by a shared weight arena, layers in execution order and the
//! outputs that must stay live.

mod display;
mod einsum;
mod error;
mod layer;
mod model;
mod shape;
mod symbolic;
mod tensor;

pub use display::dump_model;
pub use einsum::EinsumEquation;
pub use error::IrError;
pub use layer::{Activation, Layer, LayerFlags, Op};
pub use model::{
    Constant, MAX_CHUNK_BYTES, Model, ModelInput, ModelWarning, Severity, WeightRegion,
};
pub use shape::{MAX_RANK, TensorShape, normalize_axis};
pub use symbolic::{SymbolicDim, SymbolicTensorShape};
pub use tensor::{DataType, Tensor, TensorData};
