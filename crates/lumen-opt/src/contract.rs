//! Subexpression contraction.
//!
//! Recognizes decomposed operator subgraphs and replaces each with the
//! single layer it computes:
//!
//! - `Pow(x, -1)` → `Reciprocal`, `Pow(x, 0.5)` → `Sqrt`
//! - `x * Sigmoid(x)` → `Swish`
//! - `x * 0.5 * (1 + Erf(x / √2))` in its common arrangements → `Gelu`
//! - mean / variance / normalize / scale / shift over the last axis →
//!   `LayerNormalization`
//! - `Softmax(q @ kᵀ * s) @ v` → `ScaledDotProductAttention`
//!
//! The replacement takes the root's name and position; the other matched
//! layers must be consumed only inside the match and are deleted.

use std::collections::HashSet;
use std::f32::consts::{FRAC_1_SQRT_2, SQRT_2};

use lumen_ir::{Model, Op, Tensor};

use crate::error::PassError;
use crate::pattern::{Pattern, PatternBuilder, is_scalar};
use crate::remap::build_consumer_map;
use crate::Pass;

type Rewrite = fn(&Model, &[String]) -> Option<(Op, Vec<String>)>;

#[derive(Debug)]
struct ContractRule {
    name: &'static str,
    pattern: Pattern,
    rewrite: Rewrite,
}

/// Contracts known subexpressions into fused layers.
#[derive(Debug)]
pub struct ContractSubExpressionPass {
    rules: Vec<ContractRule>,
}

impl Default for ContractSubExpressionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl ContractSubExpressionPass {
    /// Creates the pass with every built-in rule, largest patterns first.
    pub fn new() -> Self {
        let mut rules = vec![attention(false), attention(true)];
        rules.extend([false, true].map(layer_norm));
        for form in [GeluForm::HalfFirst, GeluForm::HalfLast, GeluForm::HalfGate] {
            rules.push(gelu(form, true));
            rules.push(gelu(form, false));
        }
        rules.extend([swish(), reciprocal(), sqrt()]);
        Self { rules }
    }

    fn contract_once(&self, model: &mut Model) -> bool {
        let consumers = build_consumer_map(model);
        for idx in 0..model.layers.len() {
            for rule in &self.rules {
                let Some(m) = rule.pattern.match_at(model, &consumers, idx) else {
                    continue;
                };
                let Some((op, inputs)) = (rule.rewrite)(model, &m.captures) else {
                    continue;
                };
                log::debug!(
                    "contracting {} layers at '{}' into {}",
                    m.layers.len(),
                    model.layers[idx].name,
                    rule.name
                );
                replace_match(model, idx, &m.layers, op, inputs);
                return true;
            }
        }
        false
    }
}

impl Pass for ContractSubExpressionPass {
    fn name(&self) -> &str {
        "contract-subexpression"
    }

    fn run(&self, model: &mut Model) -> Result<bool, PassError> {
        let mut changed = false;
        while self.contract_once(model) {
            changed = true;
        }
        Ok(changed)
    }
}

fn replace_match(model: &mut Model, root: usize, matched: &[usize], op: Op, inputs: Vec<String>) {
    let layer = &mut model.layers[root];
    layer.op = op;
    layer.inputs = inputs;

    let interior: HashSet<usize> = matched.iter().copied().filter(|&i| i != root).collect();
    for &i in &interior {
        let name = model.layers[i].name.clone();
        model.cpu_fallback.remove(&name);
    }
    let mut index = 0;
    model.layers.retain(|_| {
        let keep = !interior.contains(&index);
        index += 1;
        keep
    });
}

fn is_scalar_like(tensor: &Tensor) -> bool {
    tensor.shape().length() == 1 && tensor.shape().rank() <= 1 && tensor.as_f32().is_ok()
}

fn is_vector(tensor: &Tensor) -> bool {
    tensor.shape().rank() <= 1 && tensor.as_f32().is_ok()
}

fn scalar_of(model: &Model, name: &str) -> Option<f32> {
    model.constant_tensor(name).ok()?.as_f32().ok()?.first().copied()
}

fn reciprocal() -> ContractRule {
    let mut p = PatternBuilder::new();
    let x = p.input();
    let e = p.constant(|t| is_scalar(t, -1.0));
    let root = p.pow(x, e);
    ContractRule {
        name: "Reciprocal",
        pattern: p.build(root, &[x]),
        rewrite: |_, c| Some((Op::Reciprocal, vec![c[0].clone()])),
    }
}

fn sqrt() -> ContractRule {
    let mut p = PatternBuilder::new();
    let x = p.input();
    let e = p.constant(|t| is_scalar(t, 0.5));
    let root = p.pow(x, e);
    ContractRule {
        name: "Sqrt",
        pattern: p.build(root, &[x]),
        rewrite: |_, c| Some((Op::Sqrt, vec![c[0].clone()])),
    }
}

fn swish() -> ContractRule {
    let mut p = PatternBuilder::new();
    let x = p.input();
    let s = p.sigmoid(x);
    let root = p.mul(x, s);
    ContractRule {
        name: "Swish",
        pattern: p.build(root, &[x]),
        rewrite: |_, c| Some((Op::Swish, vec![c[0].clone()])),
    }
}

/// Where the `0.5` factor sits in a decomposed GELU.
#[derive(Clone, Copy, Debug)]
enum GeluForm {
    /// `(x * 0.5) * gate`
    HalfFirst,
    /// `(x * gate) * 0.5`
    HalfLast,
    /// `x * (gate * 0.5)`
    HalfGate,
}

/// `gate = 1 + erf(x / √2)`, with the scaling written as a division or as
/// a multiplication by `1/√2`.
fn gelu(form: GeluForm, divide: bool) -> ContractRule {
    let mut p = PatternBuilder::new();
    let x = p.input();
    let scaled = if divide {
        let c = p.constant(|t| is_scalar(t, SQRT_2));
        p.div(x, c)
    } else {
        let c = p.constant(|t| is_scalar(t, FRAC_1_SQRT_2));
        p.mul(x, c)
    };
    let erf = p.erf(scaled);
    let one = p.constant(|t| is_scalar(t, 1.0));
    let gate = p.add(erf, one);
    let half = p.constant(|t| is_scalar(t, 0.5));
    let root = match form {
        GeluForm::HalfFirst => {
            let hx = p.mul(x, half);
            p.mul(hx, gate)
        }
        GeluForm::HalfLast => {
            let xg = p.mul(x, gate);
            p.mul(xg, half)
        }
        GeluForm::HalfGate => {
            let hg = p.mul(gate, half);
            p.mul(x, hg)
        }
    };
    ContractRule {
        name: "Gelu",
        pattern: p.build(root, &[x]),
        rewrite: |_, c| Some((Op::Gelu, vec![c[0].clone()])),
    }
}

/// Layer normalization over the last axis; the square is `Pow(d, 2)` or
/// `d * d`.
fn layer_norm(square_with_pow: bool) -> ContractRule {
    let mut p = PatternBuilder::new();
    let x = p.input();
    let mean = p.reduce_mean_last(x);
    let d = p.sub(x, mean);
    let square = if square_with_pow {
        let two = p.constant(|t| is_scalar(t, 2.0));
        p.pow(d, two)
    } else {
        p.mul(d, d)
    };
    let var = p.reduce_mean_last(square);
    let eps = p.constant(is_scalar_like);
    let shifted = p.add(var, eps);
    let std = p.sqrt(shifted);
    let norm = p.div(d, std);
    let gamma = p.constant(is_vector);
    let scaled = p.mul(norm, gamma);
    let beta = p.constant(is_vector);
    let root = p.add(scaled, beta);
    ContractRule {
        name: "LayerNormalization",
        pattern: p.build(root, &[x, eps, gamma, beta]),
        rewrite: |model, c| {
            let epsilon = scalar_of(model, &c[1])?;
            Some((
                Op::LayerNormalization { epsilon },
                vec![c[0].clone(), c[2].clone(), c[3].clone()],
            ))
        },
    }
}

/// `Softmax(q @ kᵀ * s) @ v`, or with the scores divided by `1/s`.
fn attention(divide: bool) -> ContractRule {
    let mut p = PatternBuilder::new();
    let q = p.input();
    let k = p.input();
    let v = p.input();
    let kt = p.transpose_last_two(k);
    let scores = p.matmul(q, kt);
    let c = p.constant(is_scalar_like);
    let scaled = if divide { p.div(scores, c) } else { p.mul(scores, c) };
    let probs = p.softmax_last(scaled);
    let root = p.matmul(probs, v);

    let rewrite: Rewrite = if divide {
        |model, c| {
            let d = scalar_of(model, &c[3])?;
            (d != 0.0).then(|| sdpa(1.0 / d, c))
        }
    } else {
        |model, c| Some(sdpa(scalar_of(model, &c[3])?, c))
    };
    ContractRule {
        name: "ScaledDotProductAttention",
        pattern: p.build(root, &[q, k, v, c]),
        rewrite,
    }
}

fn sdpa(scale: f32, c: &[String]) -> (Op, Vec<String>) {
    (
        Op::ScaledDotProductAttention { scale },
        vec![c[0].clone(), c[1].clone(), c[2].clone()],
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use lumen_ir::{DataType, Layer, SymbolicTensorShape};

    fn input(model: &mut Model, name: &str) {
        model
            .add_input(name, DataType::Float, SymbolicTensorShape::unknown_rank())
            .unwrap();
    }

    fn scalar(model: &mut Model, name: &str, value: f32) {
        model.add_constant(name, &Tensor::scalar_f32(value)).unwrap();
    }

    fn eval(model: &Model, feeds: &[(&str, Tensor)]) -> Tensor {
        let feeds: HashMap<String, Tensor> = feeds
            .iter()
            .map(|(n, t)| (n.to_string(), t.clone()))
            .collect();
        let mut out = lumen_cpu::run_model(model, &feeds).unwrap();
        out.remove(&model.outputs[0]).unwrap()
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        assert_eq!(a.shape(), b.shape());
        for (p, q) in a.as_f32().unwrap().iter().zip(b.as_f32().unwrap()) {
            assert!((p - q).abs() < 1e-4, "{p} vs {q}");
        }
    }

    fn contract(model: &mut Model) -> bool {
        ContractSubExpressionPass::new().run(model).unwrap()
    }

    #[test]
    fn pow_minus_one_becomes_reciprocal() {
        let mut model = Model::new();
        input(&mut model, "x");
        scalar(&mut model, "e", -1.0);
        model.add_layer(Layer::new("p", Op::Pow, &["x", "e"])).unwrap();
        model.add_output("p");

        assert!(contract(&mut model));
        assert_eq!(model.layers[0].op, Op::Reciprocal);
        assert_eq!(model.layers[0].inputs, vec!["x"]);
        assert!(!contract(&mut model));
    }

    #[test]
    fn swish_with_escaping_sigmoid_is_kept() {
        let mut model = Model::new();
        input(&mut model, "x");
        model.add_layer(Layer::new("s", Op::Sigmoid, &["x"])).unwrap();
        model.add_layer(Layer::new("m", Op::Mul, &["s", "x"])).unwrap();
        model.add_layer(Layer::new("other", Op::Exp, &["s"])).unwrap();
        model.add_output("m");
        model.add_output("other");
        assert!(!contract(&mut model));

        model.layers.pop();
        model.outputs.pop();
        assert!(contract(&mut model));
        assert_eq!(model.layers.len(), 1);
        assert_eq!(model.layers[0].name, "m");
        assert_eq!(model.layers[0].op, Op::Swish);
    }

    #[test]
    fn gelu_decomposition() {
        let mut model = Model::new();
        input(&mut model, "x");
        scalar(&mut model, "sqrt2", SQRT_2);
        scalar(&mut model, "one", 1.0);
        scalar(&mut model, "half", 0.5);
        model.add_layer(Layer::new("d", Op::Div, &["x", "sqrt2"])).unwrap();
        model.add_layer(Layer::new("e", Op::Erf, &["d"])).unwrap();
        model.add_layer(Layer::new("g", Op::Add, &["one", "e"])).unwrap();
        model.add_layer(Layer::new("h", Op::Mul, &["half", "x"])).unwrap();
        model.add_layer(Layer::new("y", Op::Mul, &["g", "h"])).unwrap();
        model.add_output("y");

        let x = Tensor::from_f32(&[5], vec![-2.0, -0.5, 0.0, 0.7, 3.0]).unwrap();
        let expected = eval(&model, &[("x", x.clone())]);
        assert!(contract(&mut model));
        assert_eq!(model.layers.len(), 1);
        assert_eq!(model.layers[0].op, Op::Gelu);
        assert_close(&eval(&model, &[("x", x)]), &expected);
    }

    #[test]
    fn layer_norm_decomposition() {
        let mut model = Model::new();
        input(&mut model, "x");
        scalar(&mut model, "two", 2.0);
        scalar(&mut model, "eps", 1e-5);
        model
            .add_constant("gamma", &Tensor::from_f32(&[4], vec![1.0, 2.0, 0.5, -1.0]).unwrap())
            .unwrap();
        model
            .add_constant("beta", &Tensor::from_f32(&[4], vec![0.0, 0.1, 0.2, 0.3]).unwrap())
            .unwrap();
        let mean = Op::ReduceMean {
            axes: vec![-1],
            keep_dims: true,
        };
        model.add_layer(Layer::new("mean", mean.clone(), &["x"])).unwrap();
        model.add_layer(Layer::new("d", Op::Sub, &["x", "mean"])).unwrap();
        model.add_layer(Layer::new("sq", Op::Pow, &["d", "two"])).unwrap();
        model.add_layer(Layer::new("var", mean, &["sq"])).unwrap();
        model.add_layer(Layer::new("ve", Op::Add, &["var", "eps"])).unwrap();
        model.add_layer(Layer::new("std", Op::Sqrt, &["ve"])).unwrap();
        model.add_layer(Layer::new("n", Op::Div, &["d", "std"])).unwrap();
        model.add_layer(Layer::new("s", Op::Mul, &["gamma", "n"])).unwrap();
        model.add_layer(Layer::new("y", Op::Add, &["s", "beta"])).unwrap();
        model.add_output("y");

        let x = Tensor::from_f32(&[2, 4], vec![1.0, 2.0, 3.0, 4.0, -1.0, 0.0, 5.0, 2.0]).unwrap();
        let expected = eval(&model, &[("x", x.clone())]);
        assert!(contract(&mut model));
        assert_eq!(model.layers.len(), 1);
        assert_eq!(model.layers[0].op, Op::LayerNormalization { epsilon: 1e-5 });
        assert_eq!(model.layers[0].inputs, vec!["x", "gamma", "beta"]);
        assert_close(&eval(&model, &[("x", x)]), &expected);
    }

    #[test]
    fn attention_decomposition() {
        let mut model = Model::new();
        for name in ["q", "k", "v"] {
            input(&mut model, name);
        }
        scalar(&mut model, "root_d", 3.0f32.sqrt());
        model
            .add_layer(Layer::new(
                "kt",
                Op::Transpose {
                    perm: Some(vec![1, 0]),
                },
                &["k"],
            ))
            .unwrap();
        model.add_layer(Layer::new("qk", Op::MatMul, &["q", "kt"])).unwrap();
        model.add_layer(Layer::new("sc", Op::Div, &["qk", "root_d"])).unwrap();
        model
            .add_layer(Layer::new("p", Op::Softmax { axis: -1 }, &["sc"]))
            .unwrap();
        model.add_layer(Layer::new("out", Op::MatMul, &["p", "v"])).unwrap();
        model.add_output("out");

        let q = Tensor::from_f32(&[2, 3], vec![0.1, 0.2, 0.3, -0.4, 0.5, 0.6]).unwrap();
        let k = Tensor::from_f32(&[4, 3], (0..12).map(|i| i as f32 * 0.1 - 0.5).collect()).unwrap();
        let v = Tensor::from_f32(&[4, 2], (0..8).map(|i| i as f32).collect()).unwrap();
        let feeds = [("q", q), ("k", k), ("v", v)];
        let expected = eval(&model, &feeds);

        assert!(contract(&mut model));
        assert_eq!(model.layers.len(), 1);
        assert!(matches!(
            model.layers[0].op,
            Op::ScaledDotProductAttention { .. }
        ));
        assert_eq!(model.layers[0].inputs, vec!["q", "k", "v"]);
        assert_close(&eval(&model, &feeds), &expected);
    }
}
