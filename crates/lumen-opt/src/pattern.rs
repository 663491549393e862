//! Tree patterns over the layer graph.
//!
//! A [`Pattern`] is an arena of placeholder nodes built with
//! [`PatternBuilder`]: free inputs, constants satisfying a predicate, and
//! layers of a given op type whose inputs are again placeholders. Matching
//! starts at a root layer and walks producers backwards. A placeholder used
//! more than once must bind the same value every time. Commutative ops try
//! both operand orders.

use std::collections::{HashMap, HashSet};

use lumen_ir::{Model, Op, Tensor};

/// Index of a placeholder in its pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PatternId(usize);

pub(crate) type ConstantPredicate = fn(&Tensor) -> bool;
pub(crate) type OpPredicate = fn(&Op) -> bool;

#[derive(Clone, Debug)]
enum Node {
    /// Any value.
    Input,
    /// A model constant accepted by the predicate.
    Constant(ConstantPredicate),
    /// A single-output layer of the given op type.
    Layer {
        op_type: &'static str,
        predicate: Option<OpPredicate>,
        inputs: Vec<PatternId>,
    },
}

#[derive(Clone, Debug, Default)]
pub(crate) struct PatternBuilder {
    nodes: Vec<Node>,
}

impl PatternBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: Node) -> PatternId {
        self.nodes.push(node);
        PatternId(self.nodes.len() - 1)
    }

    pub(crate) fn input(&mut self) -> PatternId {
        self.push(Node::Input)
    }

    pub(crate) fn constant(&mut self, predicate: ConstantPredicate) -> PatternId {
        self.push(Node::Constant(predicate))
    }

    pub(crate) fn layer(&mut self, op_type: &'static str, inputs: &[PatternId]) -> PatternId {
        self.push(Node::Layer {
            op_type,
            predicate: None,
            inputs: inputs.to_vec(),
        })
    }

    /// A layer whose op must also satisfy `predicate`.
    pub(crate) fn layer_where(
        &mut self,
        op_type: &'static str,
        predicate: OpPredicate,
        inputs: &[PatternId],
    ) -> PatternId {
        self.push(Node::Layer {
            op_type,
            predicate: Some(predicate),
            inputs: inputs.to_vec(),
        })
    }

    pub(crate) fn add(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("Add", &[a, b])
    }

    pub(crate) fn sub(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("Sub", &[a, b])
    }

    pub(crate) fn mul(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("Mul", &[a, b])
    }

    pub(crate) fn div(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("Div", &[a, b])
    }

    pub(crate) fn pow(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("Pow", &[a, b])
    }

    pub(crate) fn sqrt(&mut self, x: PatternId) -> PatternId {
        self.layer("Sqrt", &[x])
    }

    pub(crate) fn sigmoid(&mut self, x: PatternId) -> PatternId {
        self.layer("Sigmoid", &[x])
    }

    pub(crate) fn erf(&mut self, x: PatternId) -> PatternId {
        self.layer("Erf", &[x])
    }

    pub(crate) fn matmul(&mut self, a: PatternId, b: PatternId) -> PatternId {
        self.layer("MatMul", &[a, b])
    }

    /// `ReduceMean` over the last axis, keeping dims.
    pub(crate) fn reduce_mean_last(&mut self, x: PatternId) -> PatternId {
        self.layer_where(
            "ReduceMean",
            |op| matches!(op, Op::ReduceMean { axes, keep_dims: true } if axes.as_slice() == [-1]),
            &[x],
        )
    }

    /// `Transpose` swapping the two innermost axes.
    pub(crate) fn transpose_last_two(&mut self, x: PatternId) -> PatternId {
        self.layer_where(
            "Transpose",
            |op| match op {
                Op::Transpose { perm: Some(perm) } if perm.len() >= 2 => {
                    let n = perm.len();
                    perm[..n - 2].iter().enumerate().all(|(i, &p)| i == p)
                        && perm[n - 2] == n - 1
                        && perm[n - 1] == n - 2
                }
                _ => false,
            },
            &[x],
        )
    }

    /// `Softmax` over the last axis.
    pub(crate) fn softmax_last(&mut self, x: PatternId) -> PatternId {
        self.layer_where("Softmax", |op| matches!(op, Op::Softmax { axis: -1 }), &[x])
    }

    /// Finishes the pattern. `captures` lists the placeholders whose bound
    /// values a rewrite needs, in the order it reads them.
    pub(crate) fn build(self, root: PatternId, captures: &[PatternId]) -> Pattern {
        debug_assert!(matches!(self.nodes[root.0], Node::Layer { .. }));
        Pattern {
            nodes: self.nodes,
            root,
            captures: captures.to_vec(),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Pattern {
    nodes: Vec<Node>,
    root: PatternId,
    captures: Vec<PatternId>,
}

/// Bindings of a successful match.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Match {
    /// Captured value names, in capture order.
    pub captures: Vec<String>,
    /// Indices of every matched layer, root included.
    pub layers: Vec<usize>,
}

#[derive(Clone)]
struct State {
    values: Vec<Option<String>>,
    layers: Vec<Option<usize>>,
}

impl Pattern {
    /// Matches the pattern rooted at layer `root_idx`.
    ///
    /// Succeeds only if the matched subgraph is enclosed: no layer other
    /// than the root has a consumer outside the match or defines a model
    /// output, and no free input is produced inside the match.
    pub(crate) fn match_at(
        &self,
        model: &Model,
        consumers: &HashMap<String, Vec<usize>>,
        root_idx: usize,
    ) -> Option<Match> {
        let mut state = State {
            values: vec![None; self.nodes.len()],
            layers: vec![None; self.nodes.len()],
        };
        let root_name = model.layers.get(root_idx)?.name.as_str();
        if !self.match_node(model, self.root, root_name, &mut state) {
            return None;
        }

        let layers: Vec<usize> = state.layers.iter().flatten().copied().collect();
        let matched: HashSet<usize> = layers.iter().copied().collect();
        for &idx in layers.iter().filter(|&&i| i != root_idx) {
            let name = &model.layers[idx].name;
            if model.is_output(name) {
                return None;
            }
            let escapes = consumers
                .get(name)
                .is_some_and(|users| users.iter().any(|u| !matched.contains(u)));
            if escapes {
                log::trace!("pattern at '{root_name}' rejected: '{name}' escapes the match");
                return None;
            }
        }
        for (node, value) in self.nodes.iter().zip(&state.values) {
            if let (Node::Input, Some(value)) = (node, value)
                && model.layer_index(value).is_some_and(|i| matched.contains(&i))
            {
                return None;
            }
        }

        let captures = self
            .captures
            .iter()
            .map(|id| state.values[id.0].clone())
            .collect::<Option<Vec<_>>>()?;
        Some(Match { captures, layers })
    }

    fn match_node(&self, model: &Model, id: PatternId, name: &str, state: &mut State) -> bool {
        if let Some(bound) = &state.values[id.0] {
            return bound == name;
        }
        let matched = match &self.nodes[id.0] {
            Node::Input => true,
            Node::Constant(predicate) => model.is_constant(name)
                && model
                    .constant_tensor(name)
                    .is_ok_and(|tensor| predicate(&tensor)),
            Node::Layer { .. } => self.match_layer(model, id, name, state),
        };
        if matched {
            state.values[id.0] = Some(name.to_string());
        }
        matched
    }

    fn match_layer(&self, model: &Model, id: PatternId, name: &str, state: &mut State) -> bool {
        let Node::Layer {
            op_type,
            predicate,
            inputs,
        } = &self.nodes[id.0]
        else {
            return false;
        };
        let Some(idx) = model.layer_index(name) else {
            return false;
        };
        let layer = &model.layers[idx];
        if layer.op.op_type() != *op_type
            || layer.is_preserved()
            || !layer.outputs.is_empty()
            || predicate.is_some_and(|p| !p(&layer.op))
            || layer.inputs.len() != inputs.len()
            || layer.inputs.iter().any(String::is_empty)
        {
            return false;
        }
        state.layers[id.0] = Some(idx);

        let saved = state.clone();
        if self.match_operands(model, inputs, &layer.inputs, false, state) {
            return true;
        }
        if layer.op.is_commutative() && inputs.len() == 2 {
            *state = saved.clone();
            if self.match_operands(model, inputs, &layer.inputs, true, state) {
                return true;
            }
        }
        *state = saved;
        state.layers[id.0] = None;
        false
    }

    fn match_operands(
        &self,
        model: &Model,
        pattern: &[PatternId],
        actual: &[String],
        swapped: bool,
        state: &mut State,
    ) -> bool {
        pattern.iter().enumerate().all(|(i, &child)| {
            let operand = if swapped { &actual[1 - i] } else { &actual[i] };
            self.match_node(model, child, operand, state)
        })
    }
}

/// Single-element float constant close to `value`.
pub(crate) fn is_scalar(tensor: &Tensor, value: f32) -> bool {
    tensor.shape().length() == 1
        && tensor.shape().rank() <= 1
        && tensor
            .as_f32()
            .is_ok_and(|v| (v[0] - value).abs() <= 1e-4 * value.abs().max(1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remap::build_consumer_map;
    use lumen_ir::{DataType, Layer, SymbolicTensorShape};

    fn swish() -> Pattern {
        let mut p = PatternBuilder::new();
        let x = p.input();
        let s = p.sigmoid(x);
        let root = p.mul(x, s);
        p.build(root, &[x])
    }

    fn model(mul_inputs: [&str; 2]) -> Model {
        let mut model = Model::new();
        for name in ["x", "y"] {
            model
                .add_input(name, DataType::Float, SymbolicTensorShape::unknown_rank())
                .unwrap();
        }
        model.add_layer(Layer::new("s", Op::Sigmoid, &["x"])).unwrap();
        model.add_layer(Layer::new("m", Op::Mul, &mul_inputs)).unwrap();
        model.add_output("m");
        model
    }

    #[test]
    fn matches_either_operand_order() {
        for inputs in [["x", "s"], ["s", "x"]] {
            let model = model(inputs);
            let consumers = build_consumer_map(&model);
            let m = swish().match_at(&model, &consumers, 1).unwrap();
            assert_eq!(m.captures, vec!["x"]);
            assert_eq!(m.layers.len(), 2);
        }
    }

    #[test]
    fn repeated_placeholder_must_bind_one_value() {
        let model = model(["y", "s"]);
        let consumers = build_consumer_map(&model);
        assert!(swish().match_at(&model, &consumers, 1).is_none());
    }

    #[test]
    fn escaping_interior_rejects_match() {
        let mut model = model(["x", "s"]);
        model.add_output("s");
        let consumers = build_consumer_map(&model);
        assert!(swish().match_at(&model, &consumers, 1).is_none());
    }

    #[test]
    fn constant_predicates() {
        assert!(is_scalar(&Tensor::scalar_f32(0.5), 0.5));
        assert!(is_scalar(&Tensor::from_f32(&[1], vec![-1.0]).unwrap(), -1.0));
        assert!(!is_scalar(&Tensor::from_f32(&[2], vec![0.5, 0.5]).unwrap(), 0.5));
        assert!(!is_scalar(&Tensor::from_f32(&[1, 1], vec![0.5]).unwrap(), 0.5));
    }
}
