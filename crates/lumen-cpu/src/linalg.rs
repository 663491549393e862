//! Matrix products, convolution, einsum and attention.

use lumen_ir::{Activation, EinsumEquation, Tensor, TensorShape};
use ndarray::{Array3, Array4, ArrayD, Axis, Ix1, Ix4, IxDyn};

use crate::array::{Element, broadcast_dims};
use crate::elementwise::{activate, broadcast_zip};
use crate::error::ExecError;
use crate::normalize::softmax_array;

/// Broadcasts `a` to `dims` and flattens the batch axes.
fn to_batched(
    op: &'static str,
    a: &ArrayD<f32>,
    dims: &[usize],
    shape: (usize, usize, usize),
) -> Result<Array3<f32>, ExecError> {
    let view = a.broadcast(IxDyn(dims)).ok_or_else(|| {
        ExecError::shape(op, format!("cannot broadcast {:?} to {dims:?}", a.shape()))
    })?;
    Ok(Array3::from_shape_vec(shape, view.iter().copied().collect())?)
}

/// Batched matrix product with numpy broadcasting of batch dimensions.
pub(crate) fn matmul_arrays(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>, ExecError> {
    const OP: &str = "MatMul";
    let out_shape = TensorShape::new(a.shape())?.matmul(&TensorShape::new(b.shape())?)?;

    let a2 = if a.ndim() == 1 {
        a.clone().insert_axis(Axis(0))
    } else {
        a.clone()
    };
    let b2 = if b.ndim() == 1 {
        b.clone().insert_axis(Axis(1))
    } else {
        b.clone()
    };
    let (ra, rb) = (a2.ndim(), b2.ndim());
    let (m, k, n) = (a2.shape()[ra - 2], a2.shape()[ra - 1], b2.shape()[rb - 1]);

    let batch = broadcast_dims(&a2.shape()[..ra - 2], &b2.shape()[..rb - 2])?;
    let mut a_dims = batch.clone();
    a_dims.extend([m, k]);
    let mut b_dims = batch.clone();
    b_dims.extend([k, n]);
    let batch_len: usize = batch.iter().product();
    let a3 = to_batched(OP, &a2, &a_dims, (batch_len, m, k))?;
    let b3 = to_batched(OP, &b2, &b_dims, (batch_len, k, n))?;

    let mut out = Array3::<f32>::zeros((batch_len, m, n));
    for i in 0..batch_len {
        let prod = a3.index_axis(Axis(0), i).dot(&b3.index_axis(Axis(0), i));
        out.index_axis_mut(Axis(0), i).assign(&prod);
    }
    Ok(ArrayD::from_shape_vec(
        IxDyn(out_shape.dims()),
        out.into_iter().collect(),
    )?)
}

pub(crate) fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, ExecError> {
    f32::tensor(matmul_arrays(&f32::array(a)?, &f32::array(b)?)?)
}

pub(crate) fn dense(
    x: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    activation: Activation,
) -> Result<Tensor, ExecError> {
    let mut out = matmul_arrays(&f32::array(x)?, &f32::array(weights)?)?;
    if let Some(bias) = bias {
        out = broadcast_zip("Dense", &out, &f32::array(bias)?, |p, q| p + q)?;
    }
    out.mapv_inplace(|v| activate(activation, v));
    f32::tensor(out)
}

/// Convolution attributes.
pub(crate) struct ConvParams {
    pub strides: [usize; 2],
    pub pads: [usize; 4],
    pub dilations: [usize; 2],
    pub group: usize,
    pub activation: Activation,
}

/// Output spatial size of one convolution axis.
pub fn conv_output_size(input: usize, kernel: usize, stride: usize, pad: usize, dilation: usize) -> Option<usize> {
    let span = dilation * (kernel.max(1) - 1) + 1;
    let padded = input + pad;
    (padded >= span && stride > 0).then(|| (padded - span) / stride + 1)
}

pub(crate) fn conv(
    x: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    p: &ConvParams,
) -> Result<Tensor, ExecError> {
    const OP: &str = "Conv";
    let x = f32::array(x)?.into_dimensionality::<Ix4>()?;
    let w = f32::array(weights)?.into_dimensionality::<Ix4>()?;
    let (n, c, h, wd) = x.dim();
    let (m, cg, kh, kw) = w.dim();
    if p.group == 0 || c != cg * p.group || m % p.group != 0 {
        return Err(ExecError::shape(
            OP,
            format!("input channels {c} do not match weights {:?} with group {}", w.shape(), p.group),
        ));
    }
    let bias = match bias {
        Some(b) => Some(f32::array(b)?.into_dimensionality::<Ix1>()?),
        None => None,
    };
    if bias.as_ref().is_some_and(|b| b.len() != m) {
        return Err(ExecError::shape(OP, "bias length does not match output channels"));
    }

    let [pt, pl, pb, pr] = p.pads;
    let oh = conv_output_size(h, kh, p.strides[0], pt + pb, p.dilations[0])
        .ok_or_else(|| ExecError::shape(OP, "kernel larger than padded input"))?;
    let ow = conv_output_size(wd, kw, p.strides[1], pl + pr, p.dilations[1])
        .ok_or_else(|| ExecError::shape(OP, "kernel larger than padded input"))?;

    let m_per_group = m / p.group;
    let mut out = Array4::<f32>::zeros((n, m, oh, ow));
    for ((b, oc, y, xo), value) in out.indexed_iter_mut() {
        let g = oc / m_per_group;
        let mut acc = bias.as_ref().map_or(0.0, |bias| bias[oc]);
        for ic in 0..cg {
            for ky in 0..kh {
                let iy = (y * p.strides[0] + ky * p.dilations[0]) as isize - pt as isize;
                if iy < 0 || iy as usize >= h {
                    continue;
                }
                for kx in 0..kw {
                    let ix = (xo * p.strides[1] + kx * p.dilations[1]) as isize - pl as isize;
                    if ix < 0 || ix as usize >= wd {
                        continue;
                    }
                    acc += x[[b, g * cg + ic, iy as usize, ix as usize]] * w[[oc, ic, ky, kx]];
                }
            }
        }
        *value = activate(p.activation, acc);
    }
    f32::tensor(out.into_dyn())
}

/// Direct einsum over every label assignment.
pub(crate) fn einsum(equation: &str, operands: &[&Tensor]) -> Result<Tensor, ExecError> {
    let eq = EinsumEquation::parse(equation)?;
    let arrays = operands
        .iter()
        .map(|t| f32::array(t))
        .collect::<Result<Vec<_>, _>>()?;
    let shapes: Vec<&[usize]> = arrays.iter().map(|a| a.shape()).collect();
    let sizes = eq.label_sizes(&shapes)?;

    let labels = eq.labels();
    let extents: Vec<usize> = labels.iter().map(|c| sizes.get(c).copied().unwrap_or(1)).collect();
    let position = |c: &char| labels.iter().position(|l| l == c).unwrap_or(0);
    let out_axes: Vec<usize> = eq.output.iter().map(position).collect();
    let operand_axes: Vec<Vec<usize>> = eq
        .operands
        .iter()
        .map(|labels| labels.iter().map(position).collect())
        .collect();

    let out_dims: Vec<usize> = out_axes.iter().map(|&a| extents[a]).collect();
    let mut out = ArrayD::<f32>::zeros(IxDyn(&out_dims));
    let total: usize = extents.iter().product();
    let mut assignment = vec![0usize; labels.len()];
    for flat in 0..total {
        let mut rem = flat;
        for (slot, &extent) in assignment.iter_mut().zip(&extents).rev() {
            *slot = rem % extent;
            rem /= extent;
        }
        let mut product = 1.0;
        for (array, axes) in arrays.iter().zip(&operand_axes) {
            let index: Vec<usize> = axes.iter().map(|&a| assignment[a]).collect();
            product *= array[IxDyn(&index)];
        }
        let index: Vec<usize> = out_axes.iter().map(|&a| assignment[a]).collect();
        out[IxDyn(&index)] += product;
    }
    f32::tensor(out)
}

pub(crate) fn attention(q: &Tensor, k: &Tensor, v: &Tensor, scale: f32) -> Result<Tensor, ExecError> {
    let q = f32::array(q)?;
    let mut kt = f32::array(k)?;
    let rank = kt.ndim();
    if rank < 2 {
        return Err(ExecError::shape("ScaledDotProductAttention", "key must have rank >= 2"));
    }
    kt.swap_axes(rank - 2, rank - 1);
    let mut scores = matmul_arrays(&q, &kt)?;
    scores.mapv_inplace(|s| s * scale);
    let last = scores.ndim() - 1;
    softmax_array(&mut scores, last);
    f32::tensor(matmul_arrays(&scores, &f32::array(v)?)?)
}
