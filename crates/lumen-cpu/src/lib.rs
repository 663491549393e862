//! Reference CPU executor for lumen models.
//!
//! Every [`Op`](lumen_ir::Op) has a straightforward host implementation on
//! top of `ndarray`. The executor favours clarity over speed: it backs
//! constant folding in the optimizer and serves as the numerical reference
//! in tests.

mod array;
mod elementwise;
mod error;
mod executor;
mod linalg;
mod normalize;
mod random;
mod transform;

pub use array::shape_values;
pub use elementwise::activate;
pub use error::ExecError;
pub use executor::{execute, run_model};
pub use linalg::conv_output_size;
pub use normalize::reduce_axes;
pub use transform::{reshape_dims, split_sizes, transpose_perm};
