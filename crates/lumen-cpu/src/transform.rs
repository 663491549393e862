//! Data movement ops: reshape, transpose, concat, split, gather, expand.

use lumen_ir::{Tensor, normalize_axis};
use ndarray::{ArrayD, ArrayView, Axis, IxDyn, Slice};

use crate::array::{Element, broadcast_dims, shape_values, to_dims};
use crate::error::ExecError;

/// Resolves a reshape target against the input dimensions. `0` copies the
/// input dimension unless `allow_zero`; a single `-1` is inferred.
pub fn reshape_dims(input: &[usize], target: &[i64], allow_zero: bool) -> Result<Vec<usize>, ExecError> {
    const OP: &str = "Reshape";
    let length: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut inferred = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 if inferred.is_none() => {
                inferred = Some(i);
                dims.push(1);
            }
            0 if !allow_zero => {
                let d = input
                    .get(i)
                    .ok_or_else(|| ExecError::shape(OP, format!("cannot copy dimension {i}")))?;
                dims.push(*d);
            }
            t if t >= 0 => dims.push(t as usize),
            t => return Err(ExecError::shape(OP, format!("invalid target dimension {t}"))),
        }
    }
    if let Some(i) = inferred {
        let known: usize = dims.iter().product();
        if known == 0 || length % known != 0 {
            return Err(ExecError::shape(OP, format!("cannot infer dimension for {target:?} from {input:?}")));
        }
        dims[i] = length / known;
    }
    if dims.iter().product::<usize>() != length {
        return Err(ExecError::shape(OP, format!("{input:?} cannot be reshaped to {target:?}")));
    }
    Ok(dims)
}

pub(crate) fn reshape(x: &Tensor, shape: &Tensor, allow_zero: bool) -> Result<Tensor, ExecError> {
    let dims = reshape_dims(x.shape().dims(), &shape_values(shape)?, allow_zero)?;
    Ok(x.reshaped(lumen_ir::TensorShape::new(&dims)?)?)
}

/// The permutation a transpose applies; `None` reverses the axes.
pub fn transpose_perm(perm: Option<&[usize]>, rank: usize) -> Vec<usize> {
    match perm {
        Some(p) => p.to_vec(),
        None => (0..rank).rev().collect(),
    }
}

pub(crate) fn transpose<T: Element>(x: &Tensor, perm: Option<&[usize]>) -> Result<Tensor, ExecError> {
    let array = T::array(x)?;
    let perm = transpose_perm(perm, array.ndim());
    let mut seen = vec![false; array.ndim()];
    for &p in &perm {
        if p >= seen.len() || std::mem::replace(&mut seen[p], true) {
            return Err(ExecError::shape("Transpose", format!("invalid permutation {perm:?}")));
        }
    }
    if perm.len() != array.ndim() {
        return Err(ExecError::shape("Transpose", format!("invalid permutation {perm:?}")));
    }
    T::tensor(array.permuted_axes(IxDyn(&perm)))
}

pub(crate) fn concat<T: Element>(inputs: &[&Tensor], axis: isize) -> Result<Tensor, ExecError> {
    let arrays = inputs
        .iter()
        .map(|t| T::array(t))
        .collect::<Result<Vec<_>, _>>()?;
    let rank = arrays.first().map_or(0, ArrayD::ndim);
    let axis = normalize_axis(axis, rank)?;
    let views: Vec<ArrayView<'_, T, IxDyn>> = arrays.iter().map(ArrayD::view).collect();
    T::tensor(ndarray::concatenate(Axis(axis), &views)?)
}

/// Sizes of each split piece; empty `sizes` yields the whole tensor.
pub fn split_sizes(dim: usize, sizes: &[usize]) -> Vec<usize> {
    if sizes.is_empty() { vec![dim] } else { sizes.to_vec() }
}

pub(crate) fn split<T: Element>(x: &Tensor, axis: isize, sizes: &[usize]) -> Result<Vec<Tensor>, ExecError> {
    let array = T::array(x)?;
    let axis = normalize_axis(axis, array.ndim())?;
    let dim = array.shape()[axis];
    let sizes = split_sizes(dim, sizes);
    if sizes.iter().sum::<usize>() != dim {
        return Err(ExecError::shape("Split", format!("sizes {sizes:?} do not sum to {dim}")));
    }
    let mut start = 0;
    let mut out = Vec::with_capacity(sizes.len());
    for size in sizes {
        let piece = array.slice_axis(Axis(axis), Slice::from(start..start + size));
        out.push(T::tensor(piece.to_owned())?);
        start += size;
    }
    Ok(out)
}

pub(crate) fn shape_of(x: &Tensor) -> Result<Tensor, ExecError> {
    let dims: Vec<i32> = x.shape().dims().iter().map(|&d| d as i32).collect();
    Ok(Tensor::from_i32(&[dims.len()], dims)?)
}

pub(crate) fn gather<T: Element>(data: &Tensor, indices: &Tensor, axis: isize) -> Result<Tensor, ExecError> {
    let array = T::array(data)?;
    let axis = normalize_axis(axis, array.ndim())?;
    let dim = array.shape()[axis] as i64;
    let picks = shape_values(indices)?
        .into_iter()
        .map(|i| {
            let wrapped = if i < 0 { i + dim } else { i };
            if (0..dim).contains(&wrapped) {
                Ok(wrapped as usize)
            } else {
                Err(ExecError::shape("Gather", format!("index {i} out of range for {dim}")))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    let selected = array.select(Axis(axis), &picks);

    let mut dims = array.shape()[..axis].to_vec();
    dims.extend_from_slice(indices.shape().dims());
    dims.extend_from_slice(&array.shape()[axis + 1..]);
    T::tensor(ArrayD::from_shape_vec(IxDyn(&dims), selected.iter().copied().collect())?)
}

pub(crate) fn expand<T: Element>(x: &Tensor, shape: &Tensor) -> Result<Tensor, ExecError> {
    let array = T::array(x)?;
    let target = to_dims("Expand", &shape_values(shape)?)?;
    let dims = broadcast_dims(array.shape(), &target)?;
    let view = array
        .broadcast(IxDyn(&dims))
        .ok_or_else(|| ExecError::shape("Expand", format!("cannot expand {:?} to {target:?}", array.shape())))?;
    T::tensor(view.to_owned())
}

pub(crate) fn constant_of_shape(shape: &Tensor, value: f32) -> Result<Tensor, ExecError> {
    let dims = to_dims("ConstantOfShape", &shape_values(shape)?)?;
    let length = dims.iter().product();
    Ok(Tensor::from_f32(&dims, vec![value; length])?)
}
