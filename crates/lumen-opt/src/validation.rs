//! Graph validation passes.
//!
//! Check structural invariants of the model and fail with a
//! [`GraphValidationError`] when one is broken. These passes never modify
//! the model.

use std::collections::HashSet;

use lumen_ir::Model;

use crate::error::{GraphValidationError, PassError};
use crate::Pass;

/// Every layer input resolves to an input, a constant or an earlier layer,
/// every output is produced, and no name is defined twice.
#[derive(Debug)]
pub struct ValidateBrokenLinksPass;

impl Pass for ValidateBrokenLinksPass {
    fn name(&self) -> &str {
        "validate-broken-links"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        check_links(model).map_err(|e| PassError::new(self.name(), e))?;
        Ok(false)
    }
}

/// No output name is declared twice.
#[derive(Debug)]
pub struct ValidateUniqueOutputsPass;

impl Pass for ValidateUniqueOutputsPass {
    fn name(&self) -> &str {
        "validate-unique-outputs"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        check_unique_outputs(model).map_err(|e| PassError::new(self.name(), e))?;
        Ok(false)
    }
}

/// Every layer contributes to some model output, unless it is preserved.
#[derive(Debug)]
pub struct ValidateUnconnectedLayersPass;

impl Pass for ValidateUnconnectedLayersPass {
    fn name(&self) -> &str {
        "validate-unconnected-layers"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        check_connected(model).map_err(|e| PassError::new(self.name(), e))?;
        Ok(false)
    }
}

pub(crate) fn check_links(model: &Model) -> Result<(), GraphValidationError> {
    let mut defined: HashSet<&str> = HashSet::new();
    let sources = model
        .inputs
        .iter()
        .map(|i| i.name.as_str())
        .chain(model.constants.iter().map(|c| c.name.as_str()));
    for name in sources {
        if !defined.insert(name) {
            return Err(GraphValidationError::DuplicateDefinition(name.to_string()));
        }
    }

    for layer in &model.layers {
        for (_, input) in layer.present_inputs() {
            if !defined.contains(input) {
                log::warn!("layer '{}' references undefined '{input}'", layer.name);
                return Err(GraphValidationError::BrokenLink {
                    layer: layer.name.clone(),
                    input: input.to_string(),
                });
            }
        }
        for output in layer.output_names() {
            if !defined.insert(output) {
                return Err(GraphValidationError::DuplicateDefinition(output.to_string()));
            }
        }
    }

    if let Some(missing) = model.outputs.iter().find(|o| !defined.contains(o.as_str())) {
        return Err(GraphValidationError::MissingOutput(missing.clone()));
    }
    Ok(())
}

pub(crate) fn check_unique_outputs(model: &Model) -> Result<(), GraphValidationError> {
    let mut seen = HashSet::new();
    for output in &model.outputs {
        if !seen.insert(output.as_str()) {
            return Err(GraphValidationError::DuplicateOutput(output.clone()));
        }
    }
    Ok(())
}

/// Names reachable backwards from the model outputs.
pub(crate) fn live_names(model: &Model) -> HashSet<String> {
    let mut live: HashSet<String> = model.outputs.iter().cloned().collect();
    for layer in model.layers.iter().rev() {
        let needed = layer.is_preserved() || layer.output_names().any(|o| live.contains(o));
        if needed {
            for (_, input) in layer.present_inputs() {
                live.insert(input.to_string());
            }
        }
    }
    live
}

fn check_connected(model: &Model) -> Result<(), GraphValidationError> {
    let live = live_names(model);
    let unconnected: Vec<String> = model
        .layers
        .iter()
        .filter(|l| !l.is_preserved() && !l.output_names().any(|o| live.contains(o)))
        .map(|l| l.name.clone())
        .collect();
    if unconnected.is_empty() {
        Ok(())
    } else {
        Err(GraphValidationError::UnconnectedLayers(unconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_ir::{DataType, Layer, LayerFlags, Op, SymbolicTensorShape};

    fn base() -> Model {
        let mut model = Model::new();
        model
            .add_input("x", DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
        model.add_layer(Layer::new("y", Op::Relu, &["x"])).unwrap();
        model.add_output("y");
        model
    }

    #[test]
    fn valid_model_passes() {
        let mut model = base();
        assert!(!ValidateBrokenLinksPass.run(&mut model).unwrap());
        assert!(!ValidateUniqueOutputsPass.run(&mut model).unwrap());
        assert!(!ValidateUnconnectedLayersPass.run(&mut model).unwrap());
    }

    #[test]
    fn detects_out_of_order_reference() {
        let mut model = base();
        // Bypass the insertion check to build a forward reference.
        model.layers.insert(0, Layer::new("early", Op::Relu, &["y"]));
        let err = check_links(&model).unwrap_err();
        assert!(matches!(err, GraphValidationError::BrokenLink { ref layer, .. } if layer == "early"));
    }

    #[test]
    fn detects_missing_and_duplicate_outputs() {
        let mut model = base();
        model.add_output("nowhere");
        assert!(matches!(
            check_links(&model),
            Err(GraphValidationError::MissingOutput(_))
        ));

        let mut model = base();
        model.add_output("y");
        let err = ValidateUniqueOutputsPass.run(&mut model).unwrap_err();
        assert_eq!(err.pass, "validate-unique-outputs");
    }

    #[test]
    fn unconnected_layers_unless_preserved() {
        let mut model = base();
        model.add_layer(Layer::new("dead", Op::Exp, &["x"])).unwrap();
        assert!(matches!(
            check_connected(&model),
            Err(GraphValidationError::UnconnectedLayers(names)) if names == vec!["dead"]
        ));
        model.layers[1].flags |= LayerFlags::PRESERVE;
        assert!(check_connected(&model).is_ok());
    }
}
