//! Common subexpression elimination for layers and constants.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use lumen_ir::{DataType, Layer, Model, Op};

use crate::error::PassError;
use crate::remap::remove_and_remap;
use crate::Pass;

/// Merges layers with the same op, attributes and inputs.
///
/// Layers are visited in order with their inputs already rewritten through
/// earlier merges, so chains of duplicates collapse in one run.
/// Non-deterministic and preserved layers are never merged.
#[derive(Debug)]
pub struct RemoveDuplicateLayersPass;

impl Pass for RemoveDuplicateLayersPass {
    fn name(&self) -> &str {
        "remove-duplicate-layers"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut remap: HashMap<String, String> = HashMap::new();
        let mut removed = HashSet::new();
        let mut kept: Vec<Layer> = Vec::new();
        let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();

        for layer in &model.layers {
            if layer.is_preserved() || layer.op.is_non_deterministic() {
                continue;
            }
            // Identity splices of model outputs would just be spliced again.
            if layer.op == Op::Identity && model.is_output(&layer.name) {
                continue;
            }

            let mut canonical = layer.clone();
            for input in &mut canonical.inputs {
                if let Some(target) = remap.get(input.as_str()) {
                    input.clone_from(target);
                }
            }

            let bucket = buckets.entry(canonical.weak_hash()).or_default();
            let original = bucket
                .iter()
                .map(|&i| &kept[i])
                .find(|k| k.structurally_equal(&canonical));
            match original {
                Some(original) => {
                    log::debug!("'{}' duplicates '{}'", layer.name, original.name);
                    for (dup, survivor) in layer.output_names().zip(original.output_names()) {
                        remap.insert(dup.to_string(), survivor.to_string());
                    }
                    removed.insert(layer.name.clone());
                }
                None => {
                    bucket.push(kept.len());
                    kept.push(canonical);
                }
            }
        }

        if removed.is_empty() {
            return Ok(false);
        }
        remove_and_remap(model, &removed, &remap);
        Ok(true)
    }
}

/// Merges constants with the same type, shape and bytes.
#[derive(Debug)]
pub struct RemoveDuplicateConstantsPass;

impl Pass for RemoveDuplicateConstantsPass {
    fn name(&self) -> &str {
        "remove-duplicate-constants"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        // 1. Bucket by type and shape.
        let mut by_shape: HashMap<(DataType, Vec<usize>), Vec<usize>> = HashMap::new();
        for (i, constant) in model.constants.iter().enumerate() {
            by_shape
                .entry((constant.data_type, constant.shape.dims().to_vec()))
                .or_default()
                .push(i);
        }

        // 2. Within each bucket, split by content hash and compare bytes.
        let mut remap: HashMap<String, String> = HashMap::new();
        for indices in by_shape.values().filter(|v| v.len() > 1) {
            let mut by_content: HashMap<u64, Vec<usize>> = HashMap::new();
            for &i in indices {
                let constant = &model.constants[i];
                if model.is_output(&constant.name) {
                    continue;
                }
                let bytes = model
                    .weight_bytes(constant.region)
                    .map_err(|e| PassError::new(self.name(), e))?;
                let mut hasher = DefaultHasher::new();
                bytes.hash(&mut hasher);
                let candidates = by_content.entry(hasher.finish()).or_default();

                let mut survivor = None;
                for &j in candidates.iter() {
                    let other = &model.constants[j];
                    let same = other.region == constant.region
                        || model
                            .weight_bytes(other.region)
                            .map_err(|e| PassError::new(self.name(), e))?
                            == bytes;
                    if same {
                        survivor = Some(j);
                        break;
                    }
                }
                match survivor {
                    Some(j) => {
                        log::debug!(
                            "constant '{}' duplicates '{}'",
                            constant.name,
                            model.constants[j].name
                        );
                        remap.insert(constant.name.clone(), model.constants[j].name.clone());
                    }
                    None => candidates.push(i),
                }
            }
        }

        if remap.is_empty() {
            return Ok(false);
        }

        // 3. Rewire consumers, then drop the duplicates and their bytes.
        remove_and_remap(model, &HashSet::new(), &remap);
        model.retain_constants(|c| !remap.contains_key(&c.name));
        model
            .compact_weights()
            .map_err(|e| PassError::new(self.name(), e))?;
        Ok(true)
    }
}
