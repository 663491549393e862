//! Error types for model loading and saving.

use lumen_ir::IrError;

/// A model file could not be read or written.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("not a lumen model (bad magic)")]
    BadMagic,

    #[error("unsupported format version {found} (expected {expected})")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("malformed model header: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("layer '{layer}': unknown op type '{op_type}'")]
    UnknownOp { layer: String, op_type: String },

    #[error("layer '{layer}': missing or invalid attribute '{attribute}'")]
    InvalidAttribute { layer: String, attribute: String },

    #[error("'{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
