//! Forward propagation of partial tensors over a model.

use std::collections::HashMap;

use lumen_ir::{Layer, Model};

use crate::error::InferError;
use crate::infer::{RuleError, infer};
use crate::partial::{MAX_TRACKED_ELEMENTS, PartialTensor};

/// Partial tensors for every value name of a model.
#[derive(Clone, Debug, Default)]
pub struct PartialInferenceContext {
    values: HashMap<String, PartialTensor>,
}

impl PartialInferenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds inputs and constants, then infers every layer in order.
    pub fn from_model(model: &Model) -> Result<Self, InferError> {
        let mut ctx = Self::new();
        ctx.seed(model);
        for layer in &model.layers {
            ctx.infer_layer(layer)?;
        }
        Ok(ctx)
    }

    /// Model inputs are shape-only; small constants are fully known.
    pub fn seed(&mut self, model: &Model) {
        for input in &model.inputs {
            self.values.insert(
                input.name.clone(),
                PartialTensor::from_shape(input.data_type, input.shape.clone()),
            );
        }
        for constant in &model.constants {
            let known = if constant.shape.length() <= MAX_TRACKED_ELEMENTS {
                model.constant_tensor(&constant.name).ok()
            } else {
                None
            };
            let partial = match known {
                Some(tensor) => PartialTensor::from_tensor(&tensor),
                None => PartialTensor::from_shape(constant.data_type, constant.shape.into()),
            };
            self.values.insert(constant.name.clone(), partial);
        }
    }

    /// Applies the layer's rule and stores results under its output names.
    ///
    /// A referenced name that was never inferred is treated as unknown.
    pub fn infer_layer(&mut self, layer: &Layer) -> Result<(), InferError> {
        let inputs: Vec<Option<PartialTensor>> = layer
            .inputs
            .iter()
            .map(|name| {
                if name.is_empty() {
                    None
                } else {
                    Some(
                        self.values
                            .get(name)
                            .cloned()
                            .unwrap_or_else(|| PartialTensor::unknown(lumen_ir::DataType::Float)),
                    )
                }
            })
            .collect();

        let outputs = infer(&layer.op, &inputs).map_err(|e| match e {
            RuleError::Ir(source) => InferError::Shape {
                layer: layer.name.clone(),
                op: layer.op.op_type(),
                source,
            },
            RuleError::Invalid(message) => InferError::Invalid {
                layer: layer.name.clone(),
                op: layer.op.op_type(),
                message,
            },
        })?;

        for (name, value) in layer.output_names().zip(outputs) {
            self.values.insert(name.to_string(), value);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&PartialTensor> {
        self.values.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: PartialTensor) {
        self.values.insert(name.into(), value);
    }

    /// `true` if the value's elements are all statically known.
    pub fn is_fully_known(&self, name: &str) -> bool {
        self.get(name).is_some_and(PartialTensor::is_fully_known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{
        DataType, Op, SymbolicDim, SymbolicTensorShape, Tensor,
    };

    #[test]
    fn shape_chain_folds_to_known_target() {
        let mut model = Model::new();
        model
            .add_input(
                "x",
                DataType::Float,
                SymbolicTensorShape::from_dims(vec![SymbolicDim::Value(2), SymbolicDim::Value(6)]),
            )
            .unwrap();
        model
            .add_constant("idx", &Tensor::from_i32(&[1], vec![1]).unwrap())
            .unwrap();
        model.add_layer(Layer::new("s", Op::Shape, &["x"])).unwrap();
        model
            .add_layer(Layer::new("d", Op::Gather { axis: 0 }, &["s", "idx"]))
            .unwrap();

        let ctx = PartialInferenceContext::from_model(&model).unwrap();
        assert!(ctx.is_fully_known("s"));
        assert_eq!(
            ctx.get("d").unwrap().to_tensor(),
            Some(Tensor::from_i32(&[1], vec![6]).unwrap())
        );
        assert!(!ctx.is_fully_known("x"));
    }

    #[test]
    fn unresolved_names_are_unknown() {
        let layer = Layer::new("r", Op::Relu, &["ghost"]);
        let mut ctx = PartialInferenceContext::new();
        ctx.infer_layer(&layer).unwrap();
        assert_eq!(ctx.get("r").unwrap().shape().rank(), None);
    }

    #[test]
    fn rule_errors_name_the_layer() {
        let mut model = Model::new();
        model
            .add_constant("a", &Tensor::from_f32(&[2, 3], vec![0.0; 6]).unwrap())
            .unwrap();
        model
            .add_constant("b", &Tensor::from_f32(&[4, 5], vec![0.0; 20]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("mm", Op::MatMul, &["a", "b"]))
            .unwrap();
        let err = PartialInferenceContext::from_model(&model).unwrap_err();
        assert!(err.to_string().contains("mm"));
    }
}
