//! Normalization, softmax and reductions.

use lumen_ir::{Tensor, normalize_axis};
use ndarray::{ArrayD, Axis};

use crate::array::Element;
use crate::error::ExecError;

/// Splits `dims` around the channel axis 1 into `(channels, inner)`.
fn channel_layout(op: &'static str, dims: &[usize], params: usize) -> Result<(usize, usize), ExecError> {
    let channels = dims.get(1).copied().unwrap_or(1);
    if params != channels && params != 1 {
        return Err(ExecError::shape(
            op,
            format!("{params} parameters for {channels} channels"),
        ));
    }
    Ok((channels, dims.iter().skip(2).product()))
}

fn param(values: &[f32], channel: usize) -> f32 {
    if values.len() == 1 { values[0] } else { values[channel] }
}

pub(crate) fn batch_norm(
    x: &Tensor,
    scale: &Tensor,
    bias: &Tensor,
    mean: &Tensor,
    variance: &Tensor,
    epsilon: f32,
) -> Result<Tensor, ExecError> {
    let (scale, bias) = (scale.to_f32_vec(), bias.to_f32_vec());
    let (mean, variance) = (mean.to_f32_vec(), variance.to_f32_vec());
    let (channels, inner) = channel_layout("BatchNormalization", x.shape().dims(), scale.len())?;
    let mut values = x.to_f32_vec();
    for (i, v) in values.iter_mut().enumerate() {
        let c = (i / inner.max(1)) % channels.max(1);
        let inv = param(&scale, c) / (param(&variance, c) + epsilon).sqrt();
        *v = (*v - param(&mean, c)) * inv + param(&bias, c);
    }
    Ok(Tensor::from_f32(x.shape().dims(), values)?)
}

pub(crate) fn scale_bias(x: &Tensor, scale: &Tensor, bias: &Tensor) -> Result<Tensor, ExecError> {
    let (scale, bias) = (scale.to_f32_vec(), bias.to_f32_vec());
    let (channels, inner) = channel_layout("ScaleBias", x.shape().dims(), scale.len())?;
    let mut values = x.to_f32_vec();
    for (i, v) in values.iter_mut().enumerate() {
        let c = (i / inner.max(1)) % channels.max(1);
        *v = *v * param(&scale, c) + param(&bias, c);
    }
    Ok(Tensor::from_f32(x.shape().dims(), values)?)
}

pub(crate) fn layer_norm(
    x: &Tensor,
    scale: Option<&Tensor>,
    bias: Option<&Tensor>,
    epsilon: f32,
) -> Result<Tensor, ExecError> {
    let width = x.shape().dims().last().copied().unwrap_or(1).max(1);
    let scale = scale.map(Tensor::to_f32_vec);
    let bias = bias.map(Tensor::to_f32_vec);
    for p in scale.iter().chain(bias.iter()) {
        if p.len() != width && p.len() != 1 {
            return Err(ExecError::shape(
                "LayerNormalization",
                format!("{} parameters for width {width}", p.len()),
            ));
        }
    }
    let mut values = x.to_f32_vec();
    for row in values.chunks_mut(width) {
        let n = row.len() as f32;
        let mean = row.iter().sum::<f32>() / n;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv = 1.0 / (var + epsilon).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            let mut y = (*v - mean) * inv;
            if let Some(s) = &scale {
                y *= param(s, i);
            }
            if let Some(b) = &bias {
                y += param(b, i);
            }
            *v = y;
        }
    }
    Ok(Tensor::from_f32(x.shape().dims(), values)?)
}

/// In-place softmax along `axis`.
pub(crate) fn softmax_array(array: &mut ArrayD<f32>, axis: usize) {
    for mut lane in array.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
}

pub(crate) fn softmax(x: &Tensor, axis: isize) -> Result<Tensor, ExecError> {
    let mut array = f32::array(x)?;
    if array.ndim() == 0 {
        return f32::tensor(array.mapv(|_| 1.0));
    }
    let axis = normalize_axis(axis, array.ndim())?;
    softmax_array(&mut array, axis);
    f32::tensor(array)
}

/// Resolves reduction axes; an empty list reduces every axis.
pub fn reduce_axes(axes: &[isize], rank: usize) -> Result<Vec<usize>, lumen_ir::IrError> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut resolved = axes
        .iter()
        .map(|&a| normalize_axis(a, rank))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable();
    resolved.dedup();
    Ok(resolved)
}

pub(crate) fn reduce(x: &Tensor, axes: &[isize], keep_dims: bool, mean: bool) -> Result<Tensor, ExecError> {
    let mut array = f32::array(x)?;
    let axes = reduce_axes(axes, array.ndim())?;
    let count: usize = axes.iter().map(|&a| array.shape()[a]).product();
    for &axis in axes.iter().rev() {
        array = array.sum_axis(Axis(axis));
        if keep_dims {
            array = array.insert_axis(Axis(axis));
        }
    }
    if mean {
        let n = count.max(1) as f32;
        array.mapv_inplace(|v| v / n);
    }
    f32::tensor(array)
}
