//! Elementwise unary and broadcasting binary ops.

use lumen_ir::{Activation, DataType, Op, Tensor};
use ndarray::{ArrayD, IxDyn, Zip};

use crate::array::{Element, broadcast_dims};
use crate::error::ExecError;

pub(crate) fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + libm::erff(x * std::f32::consts::FRAC_1_SQRT_2))
}

/// Applies a fused activation to one value.
pub fn activate(activation: Activation, x: f32) -> f32 {
    match activation {
        Activation::None => x,
        Activation::Relu => x.max(0.0),
    }
}

/// Zips two arrays after broadcasting both to their common shape.
pub(crate) fn broadcast_zip<T: Copy, U>(
    op: &'static str,
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    f: impl Fn(T, T) -> U,
) -> Result<ArrayD<U>, ExecError> {
    let dims = broadcast_dims(a.shape(), b.shape())?;
    let mismatch = || ExecError::shape(op, format!("cannot broadcast {:?} with {:?}", a.shape(), b.shape()));
    let av = a.broadcast(IxDyn(&dims)).ok_or_else(mismatch)?;
    let bv = b.broadcast(IxDyn(&dims)).ok_or_else(mismatch)?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

pub(crate) fn binary(op: &Op, a: &Tensor, b: &Tensor) -> Result<Tensor, ExecError> {
    let name = op.op_type();
    if a.data_type() == DataType::Int && b.data_type() == DataType::Int && *op != Op::Pow {
        let x = i32::array(a)?;
        let y = i32::array(b)?;
        if *op == Op::Div && y.iter().any(|&v| v == 0) {
            return Err(ExecError::Unsupported {
                op: name,
                what: "integer division by zero".to_string(),
            });
        }
        let out = broadcast_zip(name, &x, &y, |p, q| match op {
            Op::Add => p.wrapping_add(q),
            Op::Sub => p.wrapping_sub(q),
            Op::Mul => p.wrapping_mul(q),
            _ => p.wrapping_div(q),
        })?;
        return i32::tensor(out);
    }

    let x = f32::array(a)?;
    let y = f32::array(b)?;
    let out = broadcast_zip(name, &x, &y, |p, q| match op {
        Op::Add => p + q,
        Op::Sub => p - q,
        Op::Mul => p * q,
        Op::Div => p / q,
        _ => p.powf(q),
    })?;
    f32::tensor(out)
}

pub(crate) fn unary(op: &Op, x: &Tensor) -> Result<Tensor, ExecError> {
    if *op == Op::Neg && x.data_type() == DataType::Int {
        return i32::tensor(i32::array(x)?.mapv(i32::wrapping_neg));
    }
    let f: Box<dyn Fn(f32) -> f32> = match op {
        Op::Neg => Box::new(|v: f32| -v),
        Op::Sqrt => Box::new(f32::sqrt),
        Op::Reciprocal => Box::new(f32::recip),
        Op::Exp => Box::new(f32::exp),
        Op::Erf => Box::new(libm::erff),
        Op::Tanh => Box::new(f32::tanh),
        Op::Sigmoid => Box::new(sigmoid),
        Op::Relu => Box::new(|v: f32| v.max(0.0)),
        Op::Swish => Box::new(|v: f32| v * sigmoid(v)),
        Op::Gelu => Box::new(gelu),
        Op::ScalarMad { scale, bias } => {
            let (scale, bias) = (*scale, *bias);
            Box::new(move |v: f32| v * scale + bias)
        }
        _ => {
            return Err(ExecError::Unsupported {
                op: op.op_type(),
                what: "unary op".to_string(),
            });
        }
    };
    f32::tensor(f32::array(x)?.mapv(f))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasting_add() {
        let a = Tensor::from_f32(&[2, 1], vec![1.0, 2.0]).unwrap();
        let b = Tensor::from_f32(&[3], vec![10.0, 20.0, 30.0]).unwrap();
        let out = binary(&Op::Add, &a, &b).unwrap();
        assert_eq!(out.shape().dims(), &[2, 3]);
        assert_eq!(out.as_f32().unwrap(), &[11.0, 21.0, 31.0, 12.0, 22.0, 32.0]);
    }

    #[test]
    fn int_arithmetic_stays_int() {
        let a = Tensor::from_i32(&[2], vec![7, 9]).unwrap();
        let b = Tensor::from_i32(&[], vec![2]).unwrap();
        let out = binary(&Op::Div, &a, &b).unwrap();
        assert_eq!(out.as_i32().unwrap(), &[3, 4]);
        let zero = Tensor::from_i32(&[], vec![0]).unwrap();
        assert!(binary(&Op::Div, &a, &zero).is_err());
    }

    #[test]
    fn activations() {
        let x = Tensor::from_f32(&[3], vec![-1.0, 0.0, 2.0]).unwrap();
        let relu = unary(&Op::Relu, &x).unwrap();
        assert_eq!(relu.as_f32().unwrap(), &[0.0, 0.0, 2.0]);
        let mad = unary(&Op::ScalarMad { scale: 2.0, bias: 1.0 }, &x).unwrap();
        assert_eq!(mad.as_f32().unwrap(), &[-1.0, 1.0, 5.0]);
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
    }
}
