//! Error types for the pixel backend.

use lumen_ir::IrError;

use crate::device::TextureId;

/// Errors raised while laying out, pinning or transferring textures.
#[derive(Debug, thiserror::Error)]
pub enum LayoutError {
    /// The texture needed for a tensor exceeds the device limit.
    #[error("texture of {width}x{height} exceeds the maximum size of {max}")]
    TextureTooLarge {
        /// Requested width in texels.
        width: usize,
        /// Requested height in texels.
        height: usize,
        /// Device limit for either side.
        max: usize,
    },

    /// A block axis outside the tensor's rank.
    #[error("block axis {axis} out of range for rank {rank}")]
    AxisOutOfRange {
        /// Requested axis.
        axis: usize,
        /// Rank of the tensor.
        rank: usize,
    },

    /// A texture handle the device does not know.
    #[error("unknown texture {0}")]
    UnknownTexture(TextureId),

    /// A tensor name that is not resident on the backend.
    #[error("tensor '{0}' is not resident")]
    UnknownTensor(String),

    /// A tensor name that is already resident.
    #[error("tensor '{0}' is already resident")]
    DuplicateTensor(String),

    /// A kernel name the device cannot dispatch.
    #[error("unknown kernel '{0}'")]
    UnknownKernel(String),

    /// A kernel was dispatched without a required binding.
    #[error("kernel '{kernel}' is missing binding '{binding}'")]
    MissingBinding {
        /// Kernel name.
        kernel: String,
        /// Binding name.
        binding: String,
    },

    /// Data or layouts that disagree in size.
    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch {
        /// What the operation required.
        expected: String,
        /// What it was given.
        found: String,
    },

    /// Only float tensors live in textures.
    #[error(transparent)]
    Ir(#[from] IrError),
}
