//! Constant folding over whole layers.
//!
//! A layer whose outputs are fully known from partial inference, or whose
//! inputs are all constants, is evaluated on the CPU and replaced by
//! constants under the same output names. Inference covers values derived
//! from static shapes (`Shape -> Gather -> Reshape` chains); direct
//! execution covers constants too large to track element-wise, up to
//! [`MAX_FOLDED_ELEMENTS`] per output. Larger layers stay in the graph.

use std::collections::{HashMap, HashSet};

use lumen_ir::{Model, Tensor};

use crate::context::PartialInferenceContext;
use crate::error::PassError;
use crate::partial::PartialTensor;
use crate::Pass;

/// Largest output, in elements, a layer may have to be folded by execution.
pub const MAX_FOLDED_ELEMENTS: usize = 1 << 22;

#[derive(Debug)]
pub struct FuseConstantsPass;

impl Pass for FuseConstantsPass {
    fn name(&self) -> &str {
        "fuse-constants"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut ctx = PartialInferenceContext::new();
        ctx.seed(model);

        let mut folded: HashMap<String, Tensor> = HashMap::new();
        let mut folded_layers = HashSet::new();

        for layer in &model.layers {
            ctx.infer_layer(layer)
                .map_err(|e| PassError::new(self.name(), e))?;
            if layer.is_preserved()
                || layer.op.is_non_deterministic()
                || layer.present_inputs().next().is_none()
            {
                continue;
            }

            let known: Option<Vec<Tensor>> = layer
                .output_names()
                .map(|name| ctx.get(name).and_then(PartialTensor::to_tensor))
                .collect();
            let tensors = match known {
                Some(tensors) => tensors,
                None => {
                    let all_constant = layer
                        .present_inputs()
                        .all(|(_, name)| folded.contains_key(name) || model.is_constant(name));
                    if !all_constant {
                        continue;
                    }
                    let bounded = layer.output_names().all(|name| {
                        ctx.get(name)
                            .and_then(PartialTensor::static_shape)
                            .is_some_and(|s| s.length() <= MAX_FOLDED_ELEMENTS)
                    });
                    if !bounded {
                        log::debug!(
                            "not folding '{}': output size unknown or above {MAX_FOLDED_ELEMENTS} elements",
                            layer.name
                        );
                        continue;
                    }
                    let inputs = layer
                        .inputs
                        .iter()
                        .map(|name| {
                            if name.is_empty() {
                                Ok(None)
                            } else if let Some(t) = folded.get(name) {
                                Ok(Some(t.clone()))
                            } else {
                                model.constant_tensor(name).map(Some)
                            }
                        })
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| PassError::new(self.name(), e))?;
                    let args: Vec<Option<&Tensor>> = inputs.iter().map(Option::as_ref).collect();
                    let outputs = lumen_cpu::execute(&layer.op, &args)
                        .map_err(|e| PassError::new(self.name(), e))?;
                    for (name, tensor) in layer.output_names().zip(&outputs) {
                        ctx.insert(name, PartialTensor::from_tensor(tensor));
                    }
                    outputs
                }
            };

            log::debug!("folding '{}' ({})", layer.name, layer.op.op_type());
            folded_layers.insert(layer.name.clone());
            for (name, tensor) in layer.output_names().zip(tensors) {
                folded.insert(name.to_string(), tensor);
            }
        }

        if folded_layers.is_empty() {
            return Ok(false);
        }

        model.layers.retain(|l| !folded_layers.contains(&l.name));
        model.cpu_fallback.retain(|n| !folded_layers.contains(n));
        let mut folded: Vec<(String, Tensor)> = folded.into_iter().collect();
        folded.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, tensor) in folded {
            model
                .add_constant(name, &tensor)
                .map_err(|e| PassError::new(self.name(), e))?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{DataType, Layer, LayerFlags, Op, SymbolicDim, SymbolicTensorShape};

    #[test]
    fn folds_add_of_constants() {
        let mut model = Model::new();
        model.add_constant("two", &Tensor::scalar_f32(2.0)).unwrap();
        model.add_constant("three", &Tensor::scalar_f32(3.0)).unwrap();
        model
            .add_layer(Layer::new("sum", Op::Add, &["two", "three"]))
            .unwrap();
        model.add_output("sum");

        assert!(FuseConstantsPass.run(&mut model).unwrap());
        assert!(model.layers.is_empty());
        assert_eq!(model.constant_tensor("sum").unwrap(), Tensor::scalar_f32(5.0));
        assert!(!FuseConstantsPass.run(&mut model).unwrap());
    }

    #[test]
    fn folds_shape_chain_from_static_input() {
        let mut model = Model::new();
        model
            .add_input(
                "x",
                DataType::Float,
                SymbolicTensorShape::from_dims(vec![SymbolicDim::Value(2), SymbolicDim::Value(3)]),
            )
            .unwrap();
        model.add_layer(Layer::new("s", Op::Shape, &["x"])).unwrap();
        model
            .add_layer(Layer::new("r", Op::Reshape { allow_zero: false }, &["x", "s"]))
            .unwrap();
        model.add_output("r");

        assert!(FuseConstantsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 1);
        assert_eq!(
            model.constant_tensor("s").unwrap(),
            Tensor::from_i32(&[2], vec![2, 3]).unwrap()
        );
    }

    #[test]
    fn folds_large_constants_by_execution() {
        let mut model = Model::new();
        let n = 5000;
        model
            .add_constant("a", &Tensor::from_f32(&[n], vec![1.0; n]).unwrap())
            .unwrap();
        model.add_layer(Layer::new("e", Op::Neg, &["a"])).unwrap();
        model.add_output("e");

        assert!(FuseConstantsPass.run(&mut model).unwrap());
        let folded = model.constant_tensor("e").unwrap();
        assert_eq!(folded.as_f32().unwrap()[n - 1], -1.0);
    }

    #[test]
    fn huge_constant_of_shape_stays_symbolic() {
        let mut model = Model::new();
        model
            .add_constant("s", &Tensor::from_i32(&[2], vec![1 << 20, 1 << 20]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("c", Op::ConstantOfShape { value: 1.0 }, &["s"]))
            .unwrap();
        model.add_output("c");

        assert!(!FuseConstantsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 1);
        assert!(!model.is_constant("c"));
    }

    #[test]
    fn huge_expand_stays_symbolic() {
        let mut model = Model::new();
        model
            .add_constant("one", &Tensor::from_f32(&[1, 1], vec![1.0]).unwrap())
            .unwrap();
        model
            .add_constant("target", &Tensor::from_i32(&[2], vec![1 << 16, 1 << 16]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("e", Op::Expand, &["one", "target"]))
            .unwrap();
        model.add_output("e");

        assert!(!FuseConstantsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 1);

        let ctx = PartialInferenceContext::from_model(&model).unwrap();
        let e = ctx.get("e").unwrap();
        assert!(e.elements().is_none());
        assert_eq!(e.static_shape().unwrap().dims(), [1 << 16, 1 << 16]);
    }

    #[test]
    fn small_constant_of_shape_folds() {
        let mut model = Model::new();
        model
            .add_constant("s", &Tensor::from_i32(&[2], vec![2, 3]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("c", Op::ConstantOfShape { value: 0.5 }, &["s"]))
            .unwrap();
        model.add_output("c");

        assert!(FuseConstantsPass.run(&mut model).unwrap());
        assert_eq!(
            model.constant_tensor("c").unwrap(),
            Tensor::from_f32(&[2, 3], vec![0.5; 6]).unwrap()
        );
    }

    #[test]
    fn skips_random_and_preserved_layers() {
        let mut model = Model::new();
        model.add_constant("c", &Tensor::scalar_f32(1.0)).unwrap();
        model
            .add_layer(Layer::new(
                "rand",
                Op::RandomNormal {
                    shape: vec![2],
                    mean: 0.0,
                    scale: 1.0,
                    seed: Some(7),
                },
                &[],
            ))
            .unwrap();
        model
            .add_layer(Layer::new("kept", Op::Exp, &["c"]).with_flags(LayerFlags::PRESERVE))
            .unwrap();
        model
            .add_layer(Layer::new("sum", Op::Add, &["rand", "kept"]))
            .unwrap();
        model.add_output("sum");
        assert!(!FuseConstantsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 3);
    }
}
