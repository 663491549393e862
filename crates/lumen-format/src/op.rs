//! Op <-> (op type, attributes) mapping.

use lumen_ir::{Activation, Op};

use crate::error::FormatError;
use crate::proto::AttributeProto;

fn float(name: &str, value: f32) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        f: Some(value),
        ..Default::default()
    }
}

fn int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        i: Some(value),
        ..Default::default()
    }
}

fn ints(name: &str, values: impl IntoIterator<Item = i64>) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        ints: values.into_iter().collect(),
        ..Default::default()
    }
}

fn string(name: &str, value: &str) -> AttributeProto {
    AttributeProto {
        name: name.into(),
        s: Some(value.into()),
        ..Default::default()
    }
}

fn activation_code(activation: Activation) -> i64 {
    match activation {
        Activation::None => 0,
        Activation::Relu => 1,
    }
}

fn usizes(values: &[usize]) -> impl Iterator<Item = i64> + '_ {
    values.iter().map(|&v| v as i64)
}

fn isizes(values: &[isize]) -> impl Iterator<Item = i64> + '_ {
    values.iter().map(|&v| v as i64)
}

/// Attributes of an op. The type name is [`Op::op_type`].
pub(crate) fn encode_op(op: &Op) -> Vec<AttributeProto> {
    match op {
        Op::ScalarMad { scale, bias } => vec![float("scale", *scale), float("bias", *bias)],
        Op::Dense { activation } => vec![int("activation", activation_code(*activation))],
        Op::Conv {
            strides,
            pads,
            dilations,
            group,
            activation,
        } => vec![
            ints("strides", usizes(strides)),
            ints("pads", usizes(pads)),
            ints("dilations", usizes(dilations)),
            int("group", *group as i64),
            int("activation", activation_code(*activation)),
        ],
        Op::BatchNormalization { epsilon } | Op::LayerNormalization { epsilon } => {
            vec![float("epsilon", *epsilon)]
        }
        Op::Softmax { axis } | Op::Concat { axis } | Op::Gather { axis } => {
            vec![int("axis", *axis as i64)]
        }
        Op::ReduceMean { axes, keep_dims } | Op::ReduceSum { axes, keep_dims } => vec![
            ints("axes", isizes(axes)),
            int("keep_dims", i64::from(*keep_dims)),
        ],
        Op::Reshape { allow_zero } => vec![int("allow_zero", i64::from(*allow_zero))],
        Op::Transpose { perm } => perm
            .as_deref()
            .map(|p| vec![ints("perm", usizes(p))])
            .unwrap_or_default(),
        Op::Split { axis, sizes } => vec![int("axis", *axis as i64), ints("sizes", usizes(sizes))],
        Op::ConstantOfShape { value } => vec![float("value", *value)],
        Op::Einsum { equation } => vec![string("equation", equation)],
        Op::RandomNormal {
            shape,
            mean,
            scale,
            seed,
        } => {
            let mut attrs = vec![ints("shape", usizes(shape)), float("mean", *mean), float("scale", *scale)];
            if let Some(seed) = seed {
                attrs.push(int("seed", *seed as i64));
            }
            attrs
        }
        Op::ScaledDotProductAttention { scale } => vec![float("scale", *scale)],
        _ => Vec::new(),
    }
}

/// Attribute lookup for one layer, reporting failures against it.
struct Attributes<'a> {
    layer: &'a str,
    attrs: &'a [AttributeProto],
}

impl Attributes<'_> {
    fn invalid(&self, attribute: &str) -> FormatError {
        FormatError::InvalidAttribute {
            layer: self.layer.to_string(),
            attribute: attribute.to_string(),
        }
    }

    fn get(&self, name: &str) -> Option<&AttributeProto> {
        self.attrs.iter().find(|a| a.name == name)
    }

    fn float(&self, name: &str) -> Result<f32, FormatError> {
        self.get(name).and_then(|a| a.f).ok_or_else(|| self.invalid(name))
    }

    fn int(&self, name: &str) -> Result<i64, FormatError> {
        self.get(name).and_then(|a| a.i).ok_or_else(|| self.invalid(name))
    }

    fn axis(&self, name: &str) -> Result<isize, FormatError> {
        isize::try_from(self.int(name)?).map_err(|_| self.invalid(name))
    }

    fn flag(&self, name: &str) -> Result<bool, FormatError> {
        match self.int(name)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.invalid(name)),
        }
    }

    fn count(&self, name: &str) -> Result<usize, FormatError> {
        usize::try_from(self.int(name)?).map_err(|_| self.invalid(name))
    }

    fn activation(&self) -> Result<Activation, FormatError> {
        match self.int("activation")? {
            0 => Ok(Activation::None),
            1 => Ok(Activation::Relu),
            _ => Err(self.invalid("activation")),
        }
    }

    fn sizes(&self, name: &str) -> Result<Vec<usize>, FormatError> {
        let attr = self.get(name).ok_or_else(|| self.invalid(name))?;
        attr.ints
            .iter()
            .map(|&v| usize::try_from(v).map_err(|_| self.invalid(name)))
            .collect()
    }

    fn axes(&self, name: &str) -> Result<Vec<isize>, FormatError> {
        let attr = self.get(name).ok_or_else(|| self.invalid(name))?;
        attr.ints
            .iter()
            .map(|&v| isize::try_from(v).map_err(|_| self.invalid(name)))
            .collect()
    }

    fn array<const N: usize>(&self, name: &str) -> Result<[usize; N], FormatError> {
        self.sizes(name)?.try_into().map_err(|_| self.invalid(name))
    }
}

/// Rebuilds an op from its type name and attributes.
pub(crate) fn decode_op(layer: &str, op_type: &str, attrs: &[AttributeProto]) -> Result<Op, FormatError> {
    let a = Attributes { layer, attrs };
    let op = match op_type {
        "Identity" => Op::Identity,
        "Add" => Op::Add,
        "Sub" => Op::Sub,
        "Mul" => Op::Mul,
        "Div" => Op::Div,
        "Pow" => Op::Pow,
        "Neg" => Op::Neg,
        "Sqrt" => Op::Sqrt,
        "Reciprocal" => Op::Reciprocal,
        "Exp" => Op::Exp,
        "Erf" => Op::Erf,
        "Tanh" => Op::Tanh,
        "Sigmoid" => Op::Sigmoid,
        "Relu" => Op::Relu,
        "Swish" => Op::Swish,
        "Gelu" => Op::Gelu,
        "MatMul" => Op::MatMul,
        "ScaleBias" => Op::ScaleBias,
        "Shape" => Op::Shape,
        "Expand" => Op::Expand,
        "ScalarMad" => Op::ScalarMad {
            scale: a.float("scale")?,
            bias: a.float("bias")?,
        },
        "Dense" => Op::Dense {
            activation: a.activation()?,
        },
        "Conv" => Op::Conv {
            strides: a.array("strides")?,
            pads: a.array("pads")?,
            dilations: a.array("dilations")?,
            group: a.count("group")?,
            activation: a.activation()?,
        },
        "BatchNormalization" => Op::BatchNormalization {
            epsilon: a.float("epsilon")?,
        },
        "LayerNormalization" => Op::LayerNormalization {
            epsilon: a.float("epsilon")?,
        },
        "Softmax" => Op::Softmax { axis: a.axis("axis")? },
        "Concat" => Op::Concat { axis: a.axis("axis")? },
        "Gather" => Op::Gather { axis: a.axis("axis")? },
        "ReduceMean" => Op::ReduceMean {
            axes: a.axes("axes")?,
            keep_dims: a.flag("keep_dims")?,
        },
        "ReduceSum" => Op::ReduceSum {
            axes: a.axes("axes")?,
            keep_dims: a.flag("keep_dims")?,
        },
        "Reshape" => Op::Reshape {
            allow_zero: a.flag("allow_zero")?,
        },
        "Transpose" => Op::Transpose {
            perm: a.get("perm").map(|_| a.sizes("perm")).transpose()?,
        },
        "Split" => Op::Split {
            axis: a.axis("axis")?,
            sizes: a.sizes("sizes")?,
        },
        "ConstantOfShape" => Op::ConstantOfShape {
            value: a.float("value")?,
        },
        "Einsum" => Op::Einsum {
            equation: a
                .get("equation")
                .and_then(|e| e.s.clone())
                .ok_or_else(|| a.invalid("equation"))?,
        },
        "RandomNormal" => Op::RandomNormal {
            shape: a.sizes("shape")?,
            mean: a.float("mean")?,
            scale: a.float("scale")?,
            seed: a.get("seed").map(|_| a.int("seed").map(|s| s as u64)).transpose()?,
        },
        "ScaledDotProductAttention" => Op::ScaledDotProductAttention {
            scale: a.float("scale")?,
        },
        _ => {
            return Err(FormatError::UnknownOp {
                layer: layer.to_string(),
                op_type: op_type.to_string(),
            });
        }
    };
    Ok(op)
}
