//! Conversions between IR tensors and ndarray arrays.

use lumen_ir::{DataType, Tensor, TensorShape};
use ndarray::{ArrayD, IxDyn};

use crate::error::ExecError;

/// Element types the executor computes in.
pub(crate) trait Element: Copy + Default + PartialEq + 'static {
    fn array(tensor: &Tensor) -> Result<ArrayD<Self>, ExecError>;
    fn tensor(array: ArrayD<Self>) -> Result<Tensor, ExecError>;
}

impl Element for f32 {
    fn array(tensor: &Tensor) -> Result<ArrayD<Self>, ExecError> {
        Ok(ArrayD::from_shape_vec(
            IxDyn(tensor.shape().dims()),
            tensor.to_f32_vec(),
        )?)
    }

    fn tensor(array: ArrayD<Self>) -> Result<Tensor, ExecError> {
        Ok(Tensor::from_f32(array.shape(), array.iter().copied().collect())?)
    }
}

impl Element for i32 {
    fn array(tensor: &Tensor) -> Result<ArrayD<Self>, ExecError> {
        let values = match tensor.data_type() {
            DataType::Int => tensor.as_i32()?.to_vec(),
            DataType::Float => tensor.to_f32_vec().iter().map(|&x| x as i32).collect(),
        };
        Ok(ArrayD::from_shape_vec(IxDyn(tensor.shape().dims()), values)?)
    }

    fn tensor(array: ArrayD<Self>) -> Result<Tensor, ExecError> {
        Ok(Tensor::from_i32(array.shape(), array.iter().copied().collect())?)
    }
}

/// Calls a generic function instantiated for the tensor's element type.
macro_rules! typed {
    ($dt:expr, $f:ident ( $($arg:expr),* $(,)? )) => {
        match $dt {
            lumen_ir::DataType::Float => $f::<f32>($($arg),*),
            lumen_ir::DataType::Int => $f::<i32>($($arg),*),
        }
    };
}
pub(crate) use typed;

/// Numpy broadcast of two dimension lists.
pub(crate) fn broadcast_dims(a: &[usize], b: &[usize]) -> Result<Vec<usize>, ExecError> {
    let shape = TensorShape::new(a)?.broadcast(&TensorShape::new(b)?)?;
    Ok(shape.dims().to_vec())
}

/// Reads a 1-D shape-like tensor as signed integers.
pub fn shape_values(tensor: &Tensor) -> Result<Vec<i64>, ExecError> {
    Ok(match tensor.data_type() {
        DataType::Int => tensor.as_i32()?.iter().map(|&x| i64::from(x)).collect(),
        DataType::Float => tensor.to_f32_vec().iter().map(|&x| x as i64).collect(),
    })
}

/// Converts shape values into concrete non-negative dimensions.
pub(crate) fn to_dims(op: &'static str, values: &[i64]) -> Result<Vec<usize>, ExecError> {
    values
        .iter()
        .map(|&v| usize::try_from(v).map_err(|_| ExecError::shape(op, format!("negative dimension {v}"))))
        .collect()
}
