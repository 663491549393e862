//! Display implementations and text dump for debugging.

use std::fmt::{self, Write};

use crate::layer::{Activation, Layer, Op};
use crate::model::{Model, Severity};

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Relu => write!(f, "relu"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.op_type())?;
        match self {
            Self::ScalarMad { scale, bias } => write!(f, "(scale={scale}, bias={bias})"),
            Self::Dense { activation } if *activation != Activation::None => {
                write!(f, "(activation={activation})")
            }
            Self::Conv {
                strides,
                pads,
                dilations,
                group,
                activation,
            } => write!(
                f,
                "(strides={strides:?}, pads={pads:?}, dilations={dilations:?}, group={group}, activation={activation})"
            ),
            Self::BatchNormalization { epsilon } | Self::LayerNormalization { epsilon } => {
                write!(f, "(epsilon={epsilon})")
            }
            Self::Softmax { axis } | Self::Concat { axis } | Self::Gather { axis } => {
                write!(f, "(axis={axis})")
            }
            Self::ReduceMean { axes, keep_dims } | Self::ReduceSum { axes, keep_dims } => {
                write!(f, "(axes={axes:?}, keep_dims={keep_dims})")
            }
            Self::Reshape { allow_zero: true } => write!(f, "(allow_zero)"),
            Self::Transpose { perm: Some(perm) } => write!(f, "(perm={perm:?})"),
            Self::Split { axis, sizes } => write!(f, "(axis={axis}, sizes={sizes:?})"),
            Self::ConstantOfShape { value } => write!(f, "(value={value})"),
            Self::Einsum { equation } => write!(f, "(\"{equation}\")"),
            Self::RandomNormal {
                shape,
                mean,
                scale,
                seed,
            } => write!(f, "(shape={shape:?}, mean={mean}, scale={scale}, seed={seed:?})"),
            Self::ScaledDotProductAttention { scale } => write!(f, "(scale={scale})"),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outputs: Vec<&str> = self.output_names().collect();
        write!(f, "{} = {}(", outputs.join(", "), self.op)?;
        for (i, input) in self.inputs.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if input.is_empty() {
                f.write_str("_")?;
            } else {
                write!(f, "%{input}")?;
            }
        }
        f.write_str(")")?;
        if self.is_preserved() {
            f.write_str(" [preserve]")?;
        }
        Ok(())
    }
}

/// Dumps a model as human-readable text.
pub fn dump_model(model: &Model) -> String {
    let mut out = String::new();
    // Writing into a String never fails.
    let _ = dump_model_to(&mut out, model);
    out
}

fn dump_model_to(out: &mut String, model: &Model) -> fmt::Result {
    writeln!(out, "; lumen model")?;
    for (key, value) in &model.metadata {
        writeln!(out, "; {key} = {value}")?;
    }
    for (symbol, name) in &model.symbolic_dim_names {
        writeln!(out, "; dim {symbol} = {name}")?;
    }
    writeln!(out)?;

    for input in &model.inputs {
        writeln!(out, "input %{}: {}{}", input.name, input.data_type, input.shape)?;
    }
    for constant in &model.constants {
        writeln!(
            out,
            "const %{}: {}{} @ chunk {} [{}..{}]",
            constant.name,
            constant.data_type,
            constant.shape,
            constant.region.chunk,
            constant.region.offset,
            constant.region.offset + constant.region.length,
        )?;
    }
    if !model.inputs.is_empty() || !model.constants.is_empty() {
        writeln!(out)?;
    }

    for layer in &model.layers {
        let device = if model.cpu_fallback.contains(&layer.name) {
            " ; cpu"
        } else {
            ""
        };
        writeln!(out, "{layer}{device}")?;
    }
    writeln!(out)?;

    let outputs: Vec<String> = model.outputs.iter().map(|o| format!("%{o}")).collect();
    writeln!(out, "return {}", outputs.join(", "))?;

    for warning in &model.warnings {
        writeln!(
            out,
            "; {} ({}): {}",
            warning.severity, warning.layer, warning.message
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::TensorShape;
    use crate::symbolic::SymbolicTensorShape;
    use crate::tensor::{DataType, Tensor};

    #[test]
    fn dump_small_model() {
        let mut model = Model::new();
        model
            .add_input(
                "x",
                DataType::Float,
                SymbolicTensorShape::from(TensorShape::new(&[1, 4]).unwrap()),
            )
            .unwrap();
        model
            .add_constant("w", &Tensor::from_f32(&[4, 2], vec![0.0; 8]).unwrap())
            .unwrap();
        model
            .add_layer(Layer::new("y", Op::MatMul, &["x", "w"]))
            .unwrap();
        model.add_output("y");

        let text = dump_model(&model);
        assert!(text.contains("input %x: float(1, 4)"));
        assert!(text.contains("const %w: float(4, 2) @ chunk 0 [0..32]"));
        assert!(text.contains("y = MatMul(%x, %w)"));
        assert!(text.contains("return %y"));
    }

    #[test]
    fn layer_display() {
        let layer = Layer::new("o", Op::Softmax { axis: -1 }, &["a", ""]);
        assert_eq!(layer.to_string(), "o = Softmax(axis=-1)(%a, _)");
    }
}
