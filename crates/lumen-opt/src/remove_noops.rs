//! Removal of layers that forward their input unchanged.

use std::collections::{HashMap, HashSet};

use lumen_ir::{Layer, Model, Op};

use crate::error::PassError;
use crate::remap::remove_and_remap;
use crate::Pass;

/// Removes `Identity`, identity-permutation `Transpose` and `ScalarMad(1, 0)`
/// layers and rewires their consumers to the forwarded input.
///
/// Layers that define a model output are kept so the output name survives.
#[derive(Debug)]
pub struct RemoveNoOpsPass;

impl Pass for RemoveNoOpsPass {
    fn name(&self) -> &str {
        "remove-noops"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut removed = HashSet::new();
        let mut remap: HashMap<String, String> = HashMap::new();

        for layer in &model.layers {
            if layer.is_preserved() || model.is_output(&layer.name) || !is_noop(layer) {
                continue;
            }
            let Some(input) = layer.input(0) else {
                continue;
            };
            // Forward order: the input was already resolved if it was removed.
            let target = remap.get(input).cloned().unwrap_or_else(|| input.to_string());
            log::debug!("removing no-op {} '{}'", layer.op.op_type(), layer.name);
            removed.insert(layer.name.clone());
            remap.insert(layer.name.clone(), target);
        }

        if removed.is_empty() {
            return Ok(false);
        }
        remove_and_remap(model, &removed, &remap);
        Ok(true)
    }
}

fn is_noop(layer: &Layer) -> bool {
    match &layer.op {
        Op::Identity => true,
        Op::Transpose { perm: Some(perm) } => perm.iter().enumerate().all(|(i, &p)| i == p),
        Op::ScalarMad { scale, bias } => *scale == 1.0 && *bias == 0.0,
        _ => false,
    }
}
