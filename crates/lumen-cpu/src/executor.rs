//! Op dispatch and whole-model execution.

use std::collections::HashMap;

use lumen_ir::{Model, Op, Tensor};

use crate::array::typed;
use crate::elementwise::{binary, unary};
use crate::error::ExecError;
use crate::linalg::{ConvParams, attention, conv, dense, einsum, matmul};
use crate::normalize::{batch_norm, layer_norm, reduce, scale_bias, softmax};
use crate::random::random_normal;
use crate::transform::{concat, constant_of_shape, expand, gather, reshape, shape_of, split, transpose};

fn required<'a>(op: &Op, inputs: &[Option<&'a Tensor>], index: usize) -> Result<&'a Tensor, ExecError> {
    inputs
        .get(index)
        .copied()
        .flatten()
        .ok_or(ExecError::MissingInput {
            op: op.op_type(),
            index,
        })
}

fn optional<'a>(inputs: &[Option<&'a Tensor>], index: usize) -> Option<&'a Tensor> {
    inputs.get(index).copied().flatten()
}

/// Executes one op on host tensors. `inputs` mirrors the layer's input
/// slots; `None` marks an absent optional input.
pub fn execute(op: &Op, inputs: &[Option<&Tensor>]) -> Result<Vec<Tensor>, ExecError> {
    let arg = |i| required(op, inputs, i);
    let single = |t: Tensor| -> Result<Vec<Tensor>, ExecError> { Ok(vec![t]) };
    match op {
        Op::Identity => single(arg(0)?.clone()),
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => single(binary(op, arg(0)?, arg(1)?)?),
        Op::Neg
        | Op::Sqrt
        | Op::Reciprocal
        | Op::Exp
        | Op::Erf
        | Op::Tanh
        | Op::Sigmoid
        | Op::Relu
        | Op::Swish
        | Op::Gelu
        | Op::ScalarMad { .. } => single(unary(op, arg(0)?)?),
        Op::MatMul => single(matmul(arg(0)?, arg(1)?)?),
        Op::Dense { activation } => {
            single(dense(arg(0)?, arg(1)?, optional(inputs, 2), *activation)?)
        }
        Op::Conv {
            strides,
            pads,
            dilations,
            group,
            activation,
        } => {
            let params = ConvParams {
                strides: *strides,
                pads: *pads,
                dilations: *dilations,
                group: *group,
                activation: *activation,
            };
            single(conv(arg(0)?, arg(1)?, optional(inputs, 2), &params)?)
        }
        Op::BatchNormalization { epsilon } => single(batch_norm(
            arg(0)?,
            arg(1)?,
            arg(2)?,
            arg(3)?,
            arg(4)?,
            *epsilon,
        )?),
        Op::ScaleBias => single(scale_bias(arg(0)?, arg(1)?, arg(2)?)?),
        Op::LayerNormalization { epsilon } => single(layer_norm(
            arg(0)?,
            optional(inputs, 1),
            optional(inputs, 2),
            *epsilon,
        )?),
        Op::Softmax { axis } => single(softmax(arg(0)?, *axis)?),
        Op::ReduceMean { axes, keep_dims } => single(reduce(arg(0)?, axes, *keep_dims, true)?),
        Op::ReduceSum { axes, keep_dims } => single(reduce(arg(0)?, axes, *keep_dims, false)?),
        Op::Reshape { allow_zero } => single(reshape(arg(0)?, arg(1)?, *allow_zero)?),
        Op::Transpose { perm } => {
            let x = arg(0)?;
            single(typed!(x.data_type(), transpose(x, perm.as_deref()))?)
        }
        Op::Concat { axis } => {
            let parts = inputs.iter().flatten().copied().collect::<Vec<_>>();
            let first = arg(0)?;
            single(typed!(first.data_type(), concat(&parts, *axis))?)
        }
        Op::Split { axis, sizes } => {
            let x = arg(0)?;
            typed!(x.data_type(), split(x, *axis, sizes))
        }
        Op::Shape => single(shape_of(arg(0)?)?),
        Op::Gather { axis } => {
            let data = arg(0)?;
            single(typed!(data.data_type(), gather(data, arg(1)?, *axis))?)
        }
        Op::Expand => {
            let x = arg(0)?;
            single(typed!(x.data_type(), expand(x, arg(1)?))?)
        }
        Op::ConstantOfShape { value } => single(constant_of_shape(arg(0)?, *value)?),
        Op::Einsum { equation } => {
            let operands = inputs.iter().flatten().copied().collect::<Vec<_>>();
            single(einsum(equation, &operands)?)
        }
        Op::RandomNormal {
            shape,
            mean,
            scale,
            seed,
        } => single(random_normal(shape, *mean, *scale, *seed)?),
        Op::ScaledDotProductAttention { scale } => {
            single(attention(arg(0)?, arg(1)?, arg(2)?, *scale)?)
        }
    }
}

/// Runs every layer of `model` in order and returns the declared outputs.
///
/// `feeds` supplies a value for each model input; constants are decoded
/// from the weight arena.
pub fn run_model(
    model: &Model,
    feeds: &HashMap<String, Tensor>,
) -> Result<HashMap<String, Tensor>, ExecError> {
    let mut values: HashMap<String, Tensor> = HashMap::new();
    for input in &model.inputs {
        let value = feeds
            .get(&input.name)
            .ok_or_else(|| ExecError::UnknownValue(input.name.clone()))?;
        values.insert(input.name.clone(), value.clone());
    }
    for constant in &model.constants {
        values.insert(constant.name.clone(), model.constant_tensor(&constant.name)?);
    }

    for layer in &model.layers {
        let mut args = Vec::with_capacity(layer.inputs.len());
        for name in &layer.inputs {
            if name.is_empty() {
                args.push(None);
                continue;
            }
            let value = values
                .get(name)
                .ok_or_else(|| ExecError::UnknownValue(name.clone()))?;
            args.push(Some(value));
        }
        let results = execute(&layer.op, &args).map_err(|e| ExecError::Layer {
            layer: layer.name.clone(),
            source: Box::new(e),
        })?;
        log::trace!("executed {} ({})", layer.name, layer.op.op_type());
        let names: Vec<String> = layer.output_names().map(str::to_string).collect();
        for (name, value) in names.into_iter().zip(results) {
            values.insert(name, value);
        }
    }

    model
        .outputs
        .iter()
        .map(|name| {
            values
                .get(name)
                .map(|v| (name.clone(), v.clone()))
                .ok_or_else(|| ExecError::UnknownValue(name.clone()))
        })
        .collect()
}
