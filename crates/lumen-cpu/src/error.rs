//! Errors raised while executing ops on the host.

use lumen_ir::IrError;

/// Errors that can occur during reference execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A required input slot was empty.
    #[error("{op}: missing input {index}")]
    MissingInput { op: &'static str, index: usize },

    /// Input shapes are not valid for the op.
    #[error("{op}: {message}")]
    Shape { op: &'static str, message: String },

    /// The op cannot be executed with these inputs.
    #[error("{op}: unsupported {what}")]
    Unsupported { op: &'static str, what: String },

    /// No value was available for a name when running a model.
    #[error("no value for '{0}'")]
    UnknownValue(String),

    /// Execution of a specific layer failed.
    #[error("layer '{layer}': {source}")]
    Layer {
        layer: String,
        #[source]
        source: Box<ExecError>,
    },

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Array(#[from] ndarray::ShapeError),
}

impl ExecError {
    pub(crate) fn shape(op: &'static str, message: impl Into<String>) -> Self {
        Self::Shape {
            op,
            message: message.into(),
        }
    }
}
