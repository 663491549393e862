//! Host placement of layers whose results are read on the CPU.
//!
//! Some inputs are consumed as host values: the target shape of a
//! `Reshape`, the shape operand of `Expand` and `ConstantOfShape`. Every
//! layer feeding such an input, directly or through other layers, must run
//! on the CPU. The walk stops at inputs whose data is never read (`Shape`
//! only needs its operand's static shape).
//!
//! A constant used both on the CPU and on the device is split: CPU
//! consumers get a `{name}_cpu` copy so each side owns its buffer.

use std::collections::{BTreeSet, HashMap, HashSet};

use lumen_ir::Model;

use crate::error::PassError;
use crate::Pass;

#[derive(Debug)]
pub struct CpuFallbackPass;

impl Pass for CpuFallbackPass {
    fn name(&self) -> &str {
        "cpu-fallback"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let tainted = tainted_layers(model);
        let duplicated = split_shared_constants(model, &tainted)
            .map_err(|e| PassError::new(self.name(), e))?;

        let placement: BTreeSet<String> = model
            .layers
            .iter()
            .enumerate()
            .filter(|(i, _)| tainted.contains(i))
            .map(|(_, l)| l.name.clone())
            .collect();
        let moved = placement != model.cpu_fallback;
        if moved {
            log::debug!("{} layers placed on the CPU", placement.len());
            model.cpu_fallback = placement;
        }
        Ok(moved || duplicated > 0)
    }
}

/// Indices of layers that must run on the CPU.
fn tainted_layers(model: &Model) -> HashSet<usize> {
    let mut wanted: HashSet<&str> = HashSet::new();
    for layer in &model.layers {
        for &slot in layer.op.cpu_read_inputs() {
            if let Some(name) = layer.input(slot) {
                wanted.insert(name);
            }
        }
    }

    // Layers are in execution order, so one reverse sweep reaches every
    // transitive producer.
    let mut tainted = HashSet::new();
    for (idx, layer) in model.layers.iter().enumerate().rev() {
        if !layer.output_names().any(|o| wanted.contains(o)) {
            continue;
        }
        tainted.insert(idx);
        let skip = layer.op.no_data_dependency_inputs();
        for (slot, name) in layer.present_inputs() {
            if !skip.contains(&slot) {
                wanted.insert(name);
            }
        }
    }
    tainted
}

/// Gives CPU consumers their own copy of constants the device also reads.
/// Returns the number of copies made.
fn split_shared_constants(model: &mut Model, tainted: &HashSet<usize>) -> Result<usize, lumen_ir::IrError> {
    // constant -> (layer, slot) pairs read on the host
    let mut host_uses: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
    let mut device_used: HashSet<String> = HashSet::new();
    for (idx, layer) in model.layers.iter().enumerate() {
        let on_host = tainted.contains(&idx);
        let cpu_slots = layer.op.cpu_read_inputs();
        let shape_only = layer.op.no_data_dependency_inputs();
        for (slot, name) in layer.present_inputs() {
            if !model.is_constant(name) || shape_only.contains(&slot) {
                continue;
            }
            if on_host || cpu_slots.contains(&slot) {
                host_uses.entry(name.to_string()).or_default().push((idx, slot));
            } else {
                device_used.insert(name.to_string());
            }
        }
    }

    let mut shared: Vec<(String, Vec<(usize, usize)>)> = host_uses
        .into_iter()
        .filter(|(name, _)| device_used.contains(name))
        .collect();
    shared.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, uses) in &shared {
        let copy = model.unique_name(&format!("{name}_cpu"));
        model.duplicate_constant(name, copy.as_str())?;
        log::debug!("constant '{name}' copied to '{copy}' for {} host reads", uses.len());
        for &(idx, slot) in uses {
            model.layers[idx].inputs[slot].clone_from(&copy);
        }
    }
    Ok(shared.len())
}
