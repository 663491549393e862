//! Activation fusion.
//!
//! Folds a `Relu` into the fused activation slot of the layer producing its
//! input:
//!
//! ```text
//! Conv ─▶ Relu ─▶ X        Conv{Relu} ─▶ X
//! ```
//!
//! The producer's raw output must not be observable anywhere else: it may
//! not be a model output and the `Relu` must be its only consumer.

use lumen_ir::{Activation, Model, Op};

use crate::error::PassError;
use crate::remap::{build_consumer_map, fuse_into_consumer, has_single_use};
use crate::Pass;

#[derive(Debug)]
pub struct FuseActivationsPass;

impl Pass for FuseActivationsPass {
    fn name(&self) -> &str {
        "fuse-activations"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut changed = false;
        while try_fuse_relu(model) {
            changed = true;
        }
        Ok(changed)
    }
}

fn try_fuse_relu(model: &mut Model) -> bool {
    let consumers = build_consumer_map(model);

    for relu_idx in 0..model.layers.len() {
        let relu = &model.layers[relu_idx];
        if relu.op != Op::Relu || relu.is_preserved() || relu.present_inputs().count() != 1 {
            continue;
        }
        let Some(input) = relu.input(0) else {
            continue;
        };
        let Some(producer_idx) = model.layer_index(input) else {
            continue;
        };
        let producer = &model.layers[producer_idx];
        if producer.is_preserved()
            || !producer.outputs.is_empty()
            || producer.op.activation() != Some(Activation::None)
        {
            continue;
        }
        if !has_single_use(model, input, &consumers) {
            log::trace!("'{}' has other consumers, not fusing '{}'", input, relu.name);
            continue;
        }

        let mut op = producer.op.clone();
        op.set_activation(Activation::Relu);
        let inputs = producer.inputs.clone();
        fuse_into_consumer(model, producer_idx, relu_idx, op, inputs);
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{DataType, Layer, SymbolicTensorShape, Tensor};

    fn conv_model() -> Model {
        let mut model = Model::new();
        model
            .add_input("x", DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
        model
            .add_constant("w", &Tensor::from_f32(&[1, 1, 1, 1], vec![2.0]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new(
                "conv",
                Op::Conv {
                    strides: [1, 1],
                    pads: [0; 4],
                    dilations: [1, 1],
                    group: 1,
                    activation: Activation::None,
                },
                &["x", "w", ""],
            ))
            .unwrap();
        model
    }

    #[test]
    fn conv_relu_fuses() {
        let mut model = conv_model();
        model.add_layer(Layer::new("relu", Op::Relu, &["conv"])).unwrap();
        model.add_layer(Layer::new("out", Op::Exp, &["relu"])).unwrap();
        model.add_output("out");

        assert!(FuseActivationsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 2);
        let fused = model.layer("relu").unwrap();
        assert_eq!(fused.op.activation(), Some(Activation::Relu));
        assert_eq!(fused.inputs, vec!["x", "w", ""]);
        assert!(!FuseActivationsPass.run(&mut model).unwrap());
    }

    #[test]
    fn fan_out_blocks_fusion() {
        let mut model = conv_model();
        model.add_layer(Layer::new("relu", Op::Relu, &["conv"])).unwrap();
        model
            .add_layer(Layer::new("cat", Op::Concat { axis: 1 }, &["relu", "conv"]))
            .unwrap();
        model.add_output("cat");
        assert!(!FuseActivationsPass.run(&mut model).unwrap());
    }

    #[test]
    fn producer_output_blocks_fusion() {
        let mut model = conv_model();
        model.add_layer(Layer::new("relu", Op::Relu, &["conv"])).unwrap();
        model.add_output("conv");
        model.add_output("relu");
        assert!(!FuseActivationsPass.run(&mut model).unwrap());
    }

    #[test]
    fn double_relu_fuses_once() {
        let mut model = conv_model();
        model.add_layer(Layer::new("r1", Op::Relu, &["conv"])).unwrap();
        model.add_layer(Layer::new("r2", Op::Relu, &["r1"])).unwrap();
        model.add_output("r2");
        assert!(FuseActivationsPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 2);
        assert_eq!(model.layer("r2").unwrap().inputs, vec!["r1"]);
    }
}
