//! Dense layer formation.
//!
//! `MatMul(x, W)` with a constant 2-D `W` becomes `Dense(x, W)`; when its
//! only consumer adds a constant bias of length `N` the pair collapses into
//! one `Dense(x, W, b)` named after the `Add`.

use lumen_ir::{Activation, DataType, Model, Op};

use crate::error::PassError;
use crate::remap::{build_consumer_map, fuse_into_consumer, has_single_use};
use crate::Pass;

#[derive(Debug)]
pub struct FuseDensePass;

impl Pass for FuseDensePass {
    fn name(&self) -> &str {
        "fuse-dense"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut changed = false;
        while try_fuse_matmul(model) {
            changed = true;
        }
        Ok(changed)
    }
}

/// Output width `N` of a constant float `(K, N)` weight matrix.
fn weight_columns(model: &Model, name: &str) -> Option<usize> {
    let w = model.constant(name)?;
    (w.data_type == DataType::Float && w.shape.rank() == 2).then(|| w.shape.dims()[1])
}

fn is_bias(model: &Model, name: &str, columns: usize) -> bool {
    model
        .constant(name)
        .is_some_and(|b| b.data_type == DataType::Float && b.shape.dims() == [columns])
}

fn try_fuse_matmul(model: &mut Model) -> bool {
    let consumers = build_consumer_map(model);

    for mm_idx in 0..model.layers.len() {
        let mm = &model.layers[mm_idx];
        if mm.op != Op::MatMul || mm.is_preserved() {
            continue;
        }
        let (Some(x), Some(w)) = (mm.input(0), mm.input(1)) else {
            continue;
        };
        let Some(columns) = weight_columns(model, w) else {
            continue;
        };
        let dense = Op::Dense {
            activation: Activation::None,
        };

        // 1. MatMul + Add(bias) -> Dense(x, W, b).
        if has_single_use(model, &mm.name, &consumers) {
            let add_idx = consumers[&mm.name][0];
            let add = &model.layers[add_idx];
            if add.op == Op::Add && !add.is_preserved() {
                let bias = add
                    .present_inputs()
                    .map(|(_, n)| n)
                    .find(|n| *n != mm.name);
                if let Some(bias) = bias
                    && add.present_inputs().count() == 2
                    && is_bias(model, bias, columns)
                {
                    let inputs = vec![x.to_string(), w.to_string(), bias.to_string()];
                    fuse_into_consumer(model, mm_idx, add_idx, dense, inputs);
                    return true;
                }
            }
        }

        // 2. Bare MatMul -> Dense(x, W) without bias.
        log::debug!("rewriting MatMul '{}' as Dense", mm.name);
        let inputs = vec![x.to_string(), w.to_string(), String::new()];
        let layer = &mut model.layers[mm_idx];
        layer.op = dense;
        layer.inputs = inputs;
        return true;
    }
    false
}
