//! Linear layer composition.
//!
//! Collapses chains of affine operations into a single layer:
//!
//! - `Mul/Add/Sub/Div` by a scalar constant become `ScalarMad`
//! - `ScalarMad -> ScalarMad` compose into one `ScalarMad`
//! - `Dense -> ScalarMad`, `Dense -> Add(bias)` and `Dense -> Mul(scale)`
//!   fold into the dense weights and bias
//! - `Conv -> BatchNormalization` and `Conv -> ScaleBias` fold into the
//!   convolution weights and bias
//!
//! Weight constants are rewritten in place only when the fused layer is
//! their sole reader and no other constant aliases their bytes; otherwise
//! the new values go to a fresh constant.

use std::collections::HashMap;

use lumen_ir::{Activation, DataType, IrError, Layer, Model, Op, Tensor};

use crate::context::PartialInferenceContext;
use crate::error::PassError;
use crate::remap::{build_consumer_map, fuse_into_consumer, has_single_use};
use crate::Pass;

#[derive(Debug)]
pub struct FuseLinearLayersPass;

impl Pass for FuseLinearLayersPass {
    fn name(&self) -> &str {
        "fuse-linear-layers"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut changed = false;
        loop {
            let fused = fuse_once(model).map_err(|e| PassError::new(self.name(), e))?;
            if !fused {
                break;
            }
            changed = true;
        }
        Ok(changed)
    }
}

type Consumers = HashMap<String, Vec<usize>>;

fn fuse_once(model: &mut Model) -> Result<bool, IrError> {
    Ok(try_scalar_constants(model)?
        || try_compose_scalar_mad(model)
        || try_fuse_dense_affine(model)?
        || try_fuse_conv_affine(model)?)
}

/// Value of a single-element float constant.
fn scalar_value(model: &Model, name: &str) -> Result<Option<f32>, IrError> {
    match model.constant(name) {
        Some(c) if c.data_type == DataType::Float && c.shape.length() == 1 => {
            Ok(model.constant_tensor(name)?.as_f32()?.first().copied())
        }
        _ => Ok(None),
    }
}

/// Reads a float constant with one value per channel, broadcasting a
/// single value to every channel.
fn channel_values(model: &Model, name: &str, channels: usize) -> Result<Option<Vec<f32>>, IrError> {
    let Some(c) = model.constant(name) else {
        return Ok(None);
    };
    if c.data_type != DataType::Float || c.shape.rank() > 1 {
        return Ok(None);
    }
    let values = model.constant_tensor(name)?.to_f32_vec();
    Ok(match values.len() {
        1 => Some(vec![values[0]; channels]),
        n if n == channels => Some(values),
        _ => None,
    })
}

/// Writes `tensor` over constant `name` when it is exclusively read by one
/// layer, otherwise stores it under a fresh name derived from `fallback`.
/// Returns the name holding the new values.
fn store(
    model: &mut Model,
    consumers: &Consumers,
    name: &str,
    tensor: &Tensor,
    fallback: &str,
) -> Result<String, IrError> {
    let same_layout = model
        .constant(name)
        .is_some_and(|c| c.shape == *tensor.shape() && c.data_type == tensor.data_type());
    if same_layout && has_single_use(model, name, consumers) && !model.is_region_shared(name) {
        model.write_constant(name, tensor)?;
        return Ok(name.to_string());
    }
    let new_name = model.unique_name(fallback);
    log::debug!("'{name}' is shared, writing fused values to '{new_name}'");
    model.add_constant(new_name.as_str(), tensor)?;
    Ok(new_name)
}

/// Bias input of a dense or conv layer as `channels` values; zeros when
/// the slot is empty. `None` if the bias is not a usable constant.
fn bias_values(model: &Model, layer: &Layer, channels: usize) -> Result<Option<Vec<f32>>, IrError> {
    match layer.input(2) {
        Some(bias) => channel_values(model, bias, channels),
        None => Ok(Some(vec![0.0; channels])),
    }
}

/// Stores the fused weights and bias and returns the new input list.
fn store_weights_and_bias(
    model: &mut Model,
    consumers: &Consumers,
    producer_idx: usize,
    consumer_name: &str,
    weights: Tensor,
    bias: Tensor,
) -> Result<Vec<String>, IrError> {
    let producer = &model.layers[producer_idx];
    let x = producer.inputs[0].clone();
    let w = producer.inputs[1].clone();
    let b = producer.input(2).map(str::to_string);

    let w = store(model, consumers, &w, &weights, &format!("{consumer_name}_weights"))?;
    let b = match b {
        Some(b) => store(model, consumers, &b, &bias, &format!("{consumer_name}_bias"))?,
        None => {
            let name = model.unique_name(&format!("{consumer_name}_bias"));
            model.add_constant(name.as_str(), &bias)?;
            name
        }
    };
    Ok(vec![x, w, b])
}

fn try_scalar_constants(model: &mut Model) -> Result<bool, IrError> {
    let Ok(ctx) = PartialInferenceContext::from_model(model) else {
        return Ok(false);
    };

    for idx in 0..model.layers.len() {
        let layer = &model.layers[idx];
        if layer.is_preserved() || !matches!(layer.op, Op::Add | Op::Sub | Op::Mul | Op::Div) {
            continue;
        }
        let (Some(a), Some(b)) = (layer.input(0), layer.input(1)) else {
            continue;
        };
        let (x, c, constant_first) = match (model.is_constant(a), model.is_constant(b)) {
            (false, true) => (a, b, false),
            (true, false) => (b, a, true),
            _ => continue,
        };
        let Some(value) = scalar_value(model, c)? else {
            continue;
        };

        // The scalar must not widen the rank of `x` through broadcasting.
        let c_rank = model.constant(c).map_or(0, |c| c.shape.rank());
        let Some(xp) = ctx.get(x) else {
            continue;
        };
        let keeps_rank = c_rank == 0 || xp.shape().rank().is_some_and(|r| r >= c_rank);
        if xp.data_type() != DataType::Float || !keeps_rank {
            continue;
        }

        let (scale, bias) = match (&layer.op, constant_first) {
            (Op::Mul, _) => (value, 0.0),
            (Op::Add, _) => (1.0, value),
            (Op::Sub, false) => (1.0, -value),
            (Op::Sub, true) => (-1.0, value),
            (Op::Div, false) if value != 0.0 => (1.0 / value, 0.0),
            _ => continue,
        };
        log::debug!("rewriting {} '{}' as ScalarMad", layer.op.op_type(), layer.name);
        let x = x.to_string();
        let layer = &mut model.layers[idx];
        layer.op = Op::ScalarMad { scale, bias };
        layer.inputs = vec![x];
        return Ok(true);
    }
    Ok(false)
}

fn try_compose_scalar_mad(model: &mut Model) -> bool {
    let consumers = build_consumer_map(model);

    for idx in 0..model.layers.len() {
        let outer = &model.layers[idx];
        let Op::ScalarMad { scale: s2, bias: b2 } = outer.op else {
            continue;
        };
        if outer.is_preserved() {
            continue;
        }
        let Some(input) = outer.input(0) else {
            continue;
        };
        let Some(inner_idx) = model.layer_index(input) else {
            continue;
        };
        let inner = &model.layers[inner_idx];
        let Op::ScalarMad { scale: s1, bias: b1 } = inner.op else {
            continue;
        };
        if inner.is_preserved() || !has_single_use(model, input, &consumers) {
            continue;
        }
        // (x * s1 + b1) * s2 + b2
        let op = Op::ScalarMad {
            scale: s1 * s2,
            bias: b1 * s2 + b2,
        };
        let inputs = inner.inputs.clone();
        fuse_into_consumer(model, inner_idx, idx, op, inputs);
        return true;
    }
    false
}

/// Per-column `(scale, shift)` applied by `next` to the output of the
/// layer named `producer`, if `next` is an affine op over constants.
fn column_affine(
    model: &Model,
    next: &Layer,
    producer: &str,
    columns: usize,
) -> Result<Option<(Vec<f32>, Vec<f32>)>, IrError> {
    if next.input(0).is_none() {
        return Ok(None);
    }
    if let Op::ScalarMad { scale, bias } = next.op {
        return Ok(Some((vec![scale; columns], vec![bias; columns])));
    }
    let (Some(a), Some(b)) = (next.input(0), next.input(1)) else {
        return Ok(None);
    };
    let other = if a == producer { b } else { a };
    // Only per-column vectors or true scalars keep the output shape.
    let shape_ok = model
        .constant(other)
        .is_some_and(|c| c.shape.dims() == [columns] || c.shape.rank() == 0);
    if !shape_ok {
        return Ok(None);
    }
    let Some(values) = channel_values(model, other, columns)? else {
        return Ok(None);
    };
    Ok(match next.op {
        Op::Add => Some((vec![1.0; columns], values)),
        Op::Mul => Some((values, vec![0.0; columns])),
        Op::Sub if a == producer => Some((vec![1.0; columns], values.iter().map(|v| -v).collect())),
        _ => None,
    })
}

fn try_fuse_dense_affine(model: &mut Model) -> Result<bool, IrError> {
    let consumers = build_consumer_map(model);

    for dense_idx in 0..model.layers.len() {
        let dense = &model.layers[dense_idx];
        let plain = Op::Dense {
            activation: Activation::None,
        };
        if dense.op != plain || dense.is_preserved() {
            continue;
        }
        let Some(w) = dense.input(1) else {
            continue;
        };
        let Some(wc) = model.constant(w) else {
            continue;
        };
        if wc.data_type != DataType::Float || wc.shape.rank() != 2 {
            continue;
        }
        let (rows, columns) = (wc.shape.dims()[0], wc.shape.dims()[1]);
        if !has_single_use(model, &dense.name, &consumers) {
            continue;
        }
        let next_idx = consumers[&dense.name][0];
        let next = &model.layers[next_idx];
        if next.is_preserved() {
            continue;
        }
        let Some((scale, shift)) = column_affine(model, next, &dense.name, columns)? else {
            continue;
        };
        let Some(bias) = bias_values(model, dense, columns)? else {
            continue;
        };

        let mut weights = model.constant_tensor(w)?.to_f32_vec();
        for (i, v) in weights.iter_mut().enumerate() {
            *v *= scale[i % columns];
        }
        let bias: Vec<f32> = (0..columns).map(|j| bias[j] * scale[j] + shift[j]).collect();

        let next_name = next.name.clone();
        let inputs = store_weights_and_bias(
            model,
            &consumers,
            dense_idx,
            &next_name,
            Tensor::from_f32(&[rows, columns], weights)?,
            Tensor::from_f32(&[columns], bias)?,
        )?;
        fuse_into_consumer(model, dense_idx, next_idx, plain, inputs);
        return Ok(true);
    }
    Ok(false)
}

fn try_fuse_conv_affine(model: &mut Model) -> Result<bool, IrError> {
    let consumers = build_consumer_map(model);

    for conv_idx in 0..model.layers.len() {
        let conv = &model.layers[conv_idx];
        if !matches!(
            conv.op,
            Op::Conv {
                activation: Activation::None,
                ..
            }
        ) || conv.is_preserved()
        {
            continue;
        }
        let Some(w) = conv.input(1) else {
            continue;
        };
        let Some(wc) = model.constant(w) else {
            continue;
        };
        if wc.data_type != DataType::Float || wc.shape.rank() != 4 {
            continue;
        }
        let wshape = wc.shape;
        let channels = wshape.dims()[0];
        if channels == 0 || !has_single_use(model, &conv.name, &consumers) {
            continue;
        }
        let next_idx = consumers[&conv.name][0];
        let next = &model.layers[next_idx];
        if next.is_preserved() || next.input(0) != Some(conv.name.as_str()) {
            continue;
        }

        let param = |i: usize| -> Result<Option<Vec<f32>>, IrError> {
            match next.input(i) {
                Some(name) => channel_values(model, name, channels),
                None => Ok(None),
            }
        };
        let (scale, shift) = match next.op {
            Op::BatchNormalization { epsilon } => {
                let (Some(s), Some(b), Some(mean), Some(var)) = (param(1)?, param(2)?, param(3)?, param(4)?)
                else {
                    continue;
                };
                let inv: Vec<f32> = s
                    .iter()
                    .zip(&var)
                    .map(|(s, v)| s / (v + epsilon).sqrt())
                    .collect();
                let shift: Vec<f32> = (0..channels).map(|c| b[c] - mean[c] * inv[c]).collect();
                (inv, shift)
            }
            Op::ScaleBias => {
                let (Some(s), Some(b)) = (param(1)?, param(2)?) else {
                    continue;
                };
                (s, b)
            }
            _ => continue,
        };
        let Some(bias) = bias_values(model, conv, channels)? else {
            continue;
        };

        let mut weights = model.constant_tensor(w)?.to_f32_vec();
        let per_channel = weights.len() / channels;
        for (i, v) in weights.iter_mut().enumerate() {
            *v *= scale[i / per_channel.max(1)];
        }
        let bias: Vec<f32> = (0..channels).map(|c| bias[c] * scale[c] + shift[c]).collect();

        let fused = conv.op.clone();
        let next_name = next.name.clone();
        let inputs = store_weights_and_bias(
            model,
            &consumers,
            conv_idx,
            &next_name,
            Tensor::from_f32(wshape.dims(), weights)?,
            Tensor::from_f32(&[channels], bias)?,
        )?;
        fuse_into_consumer(model, conv_idx, next_idx, fused, inputs);
        return Ok(true);
    }
    Ok(false)
}
