//! Error types for inference and passes.

use lumen_cpu::ExecError;
use lumen_ir::IrError;

/// A structural invariant of the model graph does not hold.
#[derive(Debug, thiserror::Error)]
pub enum GraphValidationError {
    /// A layer input names a value that is not defined before the layer.
    #[error("layer '{layer}' input '{input}' is not defined by an input, a constant or an earlier layer")]
    BrokenLink { layer: String, input: String },

    /// A declared model output is never produced.
    #[error("model output '{0}' is not produced")]
    MissingOutput(String),

    /// A model output is declared more than once.
    #[error("model output '{0}' is declared more than once")]
    DuplicateOutput(String),

    /// A value name is defined more than once.
    #[error("name '{0}' is defined more than once")]
    DuplicateDefinition(String),

    /// Layers whose results never reach a model output.
    #[error("layers not connected to any output: {}", .0.join(", "))]
    UnconnectedLayers(Vec<String>),
}

/// A layer's inference rule rejected its inputs.
#[derive(Debug, thiserror::Error)]
pub enum InferError {
    #[error("layer '{layer}' ({op}): {source}")]
    Shape {
        layer: String,
        op: &'static str,
        #[source]
        source: IrError,
    },

    #[error("layer '{layer}' ({op}): {message}")]
    Invalid {
        layer: String,
        op: &'static str,
        message: String,
    },
}

/// The underlying cause of a pass failure.
#[derive(Debug, thiserror::Error)]
pub enum PassFailure {
    #[error(transparent)]
    Validation(#[from] GraphValidationError),

    #[error(transparent)]
    Infer(#[from] InferError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Exec(#[from] ExecError),
}

/// A pass failed; names the pass and carries the cause.
#[derive(Debug, thiserror::Error)]
#[error("pass '{pass}' failed: {source}")]
pub struct PassError {
    pub pass: String,
    #[source]
    pub source: PassFailure,
}

impl PassError {
    pub fn new(pass: &str, source: impl Into<PassFailure>) -> Self {
        Self {
            pass: pass.to_string(),
            source: source.into(),
        }
    }
}
