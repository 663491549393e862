//! Dead layer and constant elimination.
//!
//! A single backward walk from the model outputs marks every live name;
//! layers that produce nothing live are deleted unless preserved, and
//! constants no surviving layer or output references are dropped.

use std::collections::HashSet;

use lumen_ir::Model;

use crate::error::PassError;
use crate::validation::live_names;
use crate::Pass;

#[derive(Debug)]
pub struct RemoveUnusedPass;

impl Pass for RemoveUnusedPass {
    fn name(&self) -> &str {
        "remove-unused"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let live = live_names(model);

        let before = model.layers.len();
        model
            .layers
            .retain(|l| l.is_preserved() || l.output_names().any(|o| live.contains(o)));
        let removed_layers = before - model.layers.len();

        let referenced: HashSet<String> = model
            .layers
            .iter()
            .flat_map(|l| l.present_inputs().map(|(_, n)| n.to_string()).collect::<Vec<_>>())
            .chain(model.outputs.iter().cloned())
            .collect();
        let before = model.constants.len();
        model.retain_constants(|c| referenced.contains(&c.name));
        let removed_constants = before - model.constants.len();

        if removed_constants > 0 {
            model
                .compact_weights()
                .map_err(|e| PassError::new(self.name(), e))?;
        }
        let layer_names: HashSet<&str> = model.layers.iter().map(|l| l.name.as_str()).collect();
        model.cpu_fallback.retain(|n| layer_names.contains(n.as_str()));

        if removed_layers + removed_constants > 0 {
            log::debug!("removed {removed_layers} layers and {removed_constants} constants");
        }
        Ok(removed_layers + removed_constants > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{DataType, Layer, LayerFlags, Op, SymbolicTensorShape, Tensor};

    fn model() -> Model {
        let mut model = Model::new();
        model
            .add_input("x", DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
        model.add_constant("used", &Tensor::scalar_f32(1.0)).unwrap();
        model
            .add_constant("unused", &Tensor::from_f32(&[4], vec![0.0; 4]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("y", Op::Add, &["x", "used"]))
            .unwrap();
        model
            .add_layer(Layer::new("dead", Op::Mul, &["x", "unused"]))
            .unwrap();
        model.add_output("y");
        model
    }

    #[test]
    fn removes_dead_layers_and_constants() {
        let mut model = model();
        assert!(RemoveUnusedPass.run(&mut model).unwrap());
        assert_eq!(model.layers.len(), 1);
        assert_eq!(model.constants.len(), 1);
        assert_eq!(model.weights[0].len(), 4);
        assert_eq!(model.constant_tensor("used").unwrap(), Tensor::scalar_f32(1.0));
        assert!(!RemoveUnusedPass.run(&mut model).unwrap());
    }

    #[test]
    fn preserved_layers_survive() {
        let mut model = model();
        model.layers[1].flags |= LayerFlags::PRESERVE;
        RemoveUnusedPass.run(&mut model).unwrap();
        assert!(model.layer("dead").is_some());
        assert!(model.constant("unused").is_some());
    }

    #[test]
    fn constant_output_is_kept() {
        let mut model = model();
        model.add_output("unused");
        RemoveUnusedPass.run(&mut model).unwrap();
        assert!(model.constant("unused").is_some());
    }
}
