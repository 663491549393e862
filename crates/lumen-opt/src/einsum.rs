//! Einsum lowering.
//!
//! Rewrites a two-operand `Einsum` with static shapes as
//!
//! ```text
//! A ─ Transpose ─ Reshape (batch, free_a, contracted) ─┐
//!                                                      MatMul ─ Reshape ─ Transpose ─▶ out
//! B ─ Transpose ─ Reshape (batch, contracted, free_b) ─┘
//! ```
//!
//! skipping every step that would not change its input. Equations this
//! cannot express (one operand or more than two, a label repeated within an
//! operand, a label summed inside a single operand) or operands without
//! fully known shapes leave the `Einsum` untouched.

use std::collections::{BTreeMap, HashSet};

use lumen_ir::{DataType, EinsumEquation, IrError, Layer, Model, Op, Tensor};

use crate::context::PartialInferenceContext;
use crate::error::PassError;
use crate::Pass;

#[derive(Debug)]
pub struct EinsumToMatMulPass;

impl Pass for EinsumToMatMulPass {
    fn name(&self) -> &str {
        "einsum-to-matmul"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        if !model.layers.iter().any(|l| matches!(l.op, Op::Einsum { .. })) {
            return Ok(false);
        }
        let ctx =
            PartialInferenceContext::from_model(model).map_err(|e| PassError::new(self.name(), e))?;

        let mut taken: HashSet<String> = model.defined_names().into_iter().map(str::to_string).collect();
        let mut plans = Vec::new();
        for (idx, layer) in model.layers.iter().enumerate() {
            let Op::Einsum { equation } = &layer.op else {
                continue;
            };
            if layer.is_preserved() {
                continue;
            }
            match plan(&ctx, layer, equation, &mut taken) {
                Ok(Some(lowering)) => plans.push((idx, lowering)),
                Ok(None) => {}
                Err(e) => log::debug!("keeping einsum '{}': {e}", layer.name),
            }
        }
        if plans.is_empty() {
            return Ok(false);
        }

        for (idx, lowering) in plans.into_iter().rev() {
            log::debug!(
                "lowered einsum '{}' into {} layers",
                model.layers[idx].name,
                lowering.layers.len()
            );
            for (name, tensor) in &lowering.constants {
                model
                    .add_constant(name.as_str(), tensor)
                    .map_err(|e| PassError::new(self.name(), e))?;
            }
            model.layers.splice(idx..=idx, lowering.layers);
        }
        Ok(true)
    }
}

/// Replacement layers for one einsum, in execution order; the last one
/// carries the einsum's name.
#[derive(Debug, Default)]
struct Lowering {
    constants: Vec<(String, Tensor)>,
    layers: Vec<Layer>,
}

struct Builder<'a> {
    base: &'a str,
    taken: &'a mut HashSet<String>,
    out: Lowering,
}

impl Builder<'_> {
    fn fresh(&mut self, suffix: &str) -> String {
        let stem = format!("{}_{suffix}", self.base);
        let mut name = stem.clone();
        let mut i = 1;
        while self.taken.contains(&name) {
            name = format!("{stem}_{i}");
            i += 1;
        }
        self.taken.insert(name.clone());
        name
    }

    fn transpose(&mut self, input: String, perm: Vec<usize>, suffix: &str) -> String {
        if perm.iter().enumerate().all(|(i, &p)| i == p) {
            return input;
        }
        let name = self.fresh(suffix);
        self.out.layers.push(Layer::new(
            name.as_str(),
            Op::Transpose { perm: Some(perm) },
            &[input.as_str()],
        ));
        name
    }

    fn reshape(&mut self, input: String, from: &[usize], to: &[usize], suffix: &str) -> Result<String, IrError> {
        if from == to {
            return Ok(input);
        }
        let shape_name = self.fresh(&format!("{suffix}_shape"));
        let dims: Vec<i32> = to.iter().map(|&d| d as i32).collect();
        self.out
            .constants
            .push((shape_name.clone(), Tensor::from_i32(&[dims.len()], dims)?));
        let name = self.fresh(suffix);
        self.out.layers.push(Layer::new(
            name.as_str(),
            Op::Reshape { allow_zero: true },
            &[input.as_str(), shape_name.as_str()],
        ));
        Ok(name)
    }
}

fn plan(
    ctx: &PartialInferenceContext,
    layer: &Layer,
    equation: &str,
    taken: &mut HashSet<String>,
) -> Result<Option<Lowering>, IrError> {
    let eq = EinsumEquation::parse(equation)?;
    let skip = |reason: &str| -> Result<Option<Lowering>, IrError> {
        log::debug!("keeping einsum '{}': {reason}", layer.name);
        Ok(None)
    };

    // 1. Exactly two operands with static float shapes.
    let (Some(a), Some(b)) = (layer.input(0), layer.input(1)) else {
        return skip("needs exactly two operands");
    };
    if eq.operands.len() != 2 || layer.present_inputs().count() != 2 {
        return skip("needs exactly two operands");
    }
    let shape_of = |name: &str| {
        ctx.get(name)
            .filter(|p| p.data_type() == DataType::Float)
            .and_then(|p| p.static_shape())
    };
    let (Some(shape_a), Some(shape_b)) = (shape_of(a), shape_of(b)) else {
        return skip("operand shapes are not static");
    };
    let (la, lb, lo) = (&eq.operands[0], &eq.operands[1], &eq.output);
    let sizes = eq.label_sizes(&[shape_a.dims(), shape_b.dims()])?;

    // 2. Classify labels.
    for labels in [la, lb] {
        if labels.iter().enumerate().any(|(i, c)| labels[..i].contains(c)) {
            return skip("label repeated within an operand");
        }
    }
    let (mut batch, mut contracted, mut free_a, mut free_b) = (vec![], vec![], vec![], vec![]);
    for &c in la {
        match (lb.contains(&c), lo.contains(&c)) {
            (true, true) => batch.push(c),
            (true, false) => contracted.push(c),
            (false, true) => free_a.push(c),
            (false, false) => return skip("label summed within one operand"),
        }
    }
    for &c in lb {
        match (la.contains(&c), lo.contains(&c)) {
            (false, true) => free_b.push(c),
            (false, false) => return skip("label summed within one operand"),
            (true, _) => {}
        }
    }

    let size = |labels: &[char]| dims(&sizes, labels).iter().product::<usize>();
    let matrix = |outer: usize, rows: usize, cols: usize| {
        if batch.is_empty() {
            vec![rows, cols]
        } else {
            vec![outer, rows, cols]
        }
    };
    let (nb, m, k, n) = (
        size(batch.as_slice()),
        size(free_a.as_slice()),
        size(contracted.as_slice()),
        size(free_b.as_slice()),
    );

    // 3. Emit the layer sequence.
    let mut builder = Builder {
        base: &layer.name,
        taken,
        out: Lowering::default(),
    };

    let order_a = [batch.as_slice(), free_a.as_slice(), contracted.as_slice()].concat();
    let a_t = builder.transpose(a.to_string(), perm(la, &order_a), "lhs_transpose");
    let a_m = builder.reshape(a_t, &dims(&sizes, &order_a), &matrix(nb, m, k), "lhs_reshape")?;

    let order_b = [batch.as_slice(), contracted.as_slice(), free_b.as_slice()].concat();
    let b_t = builder.transpose(b.to_string(), perm(lb, &order_b), "rhs_transpose");
    let b_m = builder.reshape(b_t, &dims(&sizes, &order_b), &matrix(nb, k, n), "rhs_reshape")?;

    let product = builder.fresh("matmul");
    builder
        .out
        .layers
        .push(Layer::new(product.as_str(), Op::MatMul, &[a_m.as_str(), b_m.as_str()]));

    let order_out = [batch.as_slice(), free_a.as_slice(), free_b.as_slice()].concat();
    let unflat = builder.reshape(product, &matrix(nb, m, n), &dims(&sizes, &order_out), "out_reshape")?;
    builder.transpose(unflat, perm(&order_out, lo), "out_transpose");

    let mut lowering = builder.out;
    if let Some(last) = lowering.layers.last_mut() {
        last.name.clone_from(&layer.name);
    }
    Ok(Some(lowering))
}

fn dims(sizes: &BTreeMap<char, usize>, labels: &[char]) -> Vec<usize> {
    labels.iter().map(|c| sizes[c]).collect()
}

/// Positions in `from` of each label of `to`.
fn perm(from: &[char], to: &[char]) -> Vec<usize> {
    to.iter()
        .filter_map(|c| from.iter().position(|x| x == c))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use lumen_ir::{SymbolicDim, SymbolicTensorShape};

    fn static_input(model: &mut Model, name: &str, dims: &[usize]) {
        let dims = dims.iter().map(|&d| SymbolicDim::Value(d)).collect();
        model
            .add_input(name, DataType::Float, SymbolicTensorShape::from_dims(dims))
            .unwrap();
    }

    fn ramp(dims: &[usize], offset: f32) -> Tensor {
        let n = dims.iter().product::<usize>();
        Tensor::from_f32(dims, (0..n).map(|i| (i as f32 * 0.37 + offset).sin()).collect()).unwrap()
    }

    fn einsum_model(equation: &str, a: &[usize], b: &[usize]) -> Model {
        let mut model = Model::new();
        static_input(&mut model, "a", a);
        static_input(&mut model, "b", b);
        model
            .add_layer(Layer::new(
                "e",
                Op::Einsum {
                    equation: equation.to_string(),
                },
                &["a", "b"],
            ))
            .unwrap();
        model.add_output("e");
        model
    }

    fn check_lowering(equation: &str, a: &[usize], b: &[usize]) -> Model {
        let mut model = einsum_model(equation, a, b);
        let feeds = HashMap::from([
            ("a".to_string(), ramp(a, 0.0)),
            ("b".to_string(), ramp(b, 1.0)),
        ]);
        let expected = lumen_cpu::run_model(&model, &feeds).unwrap().remove("e").unwrap();

        assert!(EinsumToMatMulPass.run(&mut model).unwrap(), "{equation}");
        assert!(!model.layers.iter().any(|l| matches!(l.op, Op::Einsum { .. })));
        assert_eq!(model.layers.last().unwrap().name, "e");

        let actual = lumen_cpu::run_model(&model, &feeds).unwrap().remove("e").unwrap();
        assert_eq!(actual.shape(), expected.shape(), "{equation}");
        for (x, y) in actual.as_f32().unwrap().iter().zip(expected.as_f32().unwrap()) {
            assert!((x - y).abs() < 1e-4, "{equation}: {x} vs {y}");
        }
        model
    }

    #[test]
    fn plain_matmul_needs_no_reshapes() {
        let model = check_lowering("ij,jk->ik", &[2, 3], &[3, 4]);
        assert_eq!(model.layers.len(), 1);
        assert_eq!(model.layers[0].op, Op::MatMul);
        assert!(model.constants.is_empty());
    }

    #[test]
    fn batched_and_transposed_equations() {
        check_lowering("bij,bjk->bik", &[2, 2, 3], &[2, 3, 4]);
        check_lowering("ij,kj->ik", &[2, 3], &[4, 3]);
        check_lowering("ij,jk->ki", &[2, 3], &[3, 4]);
        check_lowering("bhqd,bhkd->bhqk", &[1, 2, 3, 4], &[1, 2, 5, 4]);
        check_lowering("i,j->ij", &[3], &[4]);
        check_lowering("ij,j->i", &[2, 3], &[3]);
        check_lowering("abc,cd", &[2, 3, 4], &[4, 5]);
    }

    #[test]
    fn unsupported_forms_are_kept() {
        for (equation, a, b) in [
            ("ij,jk->i", &[2, 3][..], &[3, 4][..]),
            ("ii,ij->ij", &[3, 3], &[3, 4]),
        ] {
            let mut model = einsum_model(equation, a, b);
            assert!(!EinsumToMatMulPass.run(&mut model).unwrap(), "{equation}");
        }
    }

    #[test]
    fn dynamic_shapes_are_kept() {
        let mut model = Model::new();
        model
            .add_input(
                "a",
                DataType::Float,
                SymbolicTensorShape::from_dims(vec![SymbolicDim::Param('n'), SymbolicDim::Value(3)]),
            )
            .unwrap();
        static_input(&mut model, "b", &[3, 4]);
        model
            .add_layer(Layer::new(
                "e",
                Op::Einsum {
                    equation: "ij,jk->ik".into(),
                },
                &["a", "b"],
            ))
            .unwrap();
        model.add_output("e");
        assert!(!EinsumToMatMulPass.run(&mut model).unwrap());
    }
}
