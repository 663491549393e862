use std::collections::HashMap;

use lumen_ir::{DataType, Layer, Model, Op, SymbolicTensorShape, Tensor, TensorShape};
use lumen_opt::{OptLevel, PassManager};

/// Declares a float input with a fully static shape.
#[allow(dead_code)]
pub fn static_input(model: &mut Model, name: &str, dims: &[usize]) {
    model
        .add_input(
            name,
            DataType::Float,
            SymbolicTensorShape::from(TensorShape::new(dims).unwrap()),
        )
        .unwrap();
}

/// Deterministic, non-trivial float data.
#[allow(dead_code)]
pub fn ramp(dims: &[usize], offset: f32) -> Tensor {
    let n = dims.iter().product::<usize>();
    Tensor::from_f32(dims, (0..n).map(|i| (i as f32 * 0.37 + offset).sin()).collect()).unwrap()
}

/// A small MLP block: `swish(relu(x * 2 @ w + b))` plus leftovers the
/// cleanup passes should remove.
#[allow(dead_code)]
pub fn mlp_model() -> Model {
    let mut model = Model::new();
    static_input(&mut model, "x", &[3, 4]);
    model.add_constant("two", &Tensor::scalar_f32(2.0)).unwrap();
    model.add_constant("w", &ramp(&[4, 5], 0.3)).unwrap();
    model.add_constant("b", &ramp(&[5], 1.1)).unwrap();
    model.alias_constant("w_again", "w").unwrap();

    let layers = [
        Layer::new("scaled", Op::Mul, &["x", "two"]),
        Layer::new("copy", Op::Identity, &["scaled"]),
        Layer::new("mm", Op::MatMul, &["copy", "w"]),
        Layer::new("biased", Op::Add, &["mm", "b"]),
        Layer::new("act", Op::Relu, &["biased"]),
        Layer::new("gate", Op::Sigmoid, &["act"]),
        Layer::new("out", Op::Mul, &["act", "gate"]),
        Layer::new("unused", Op::MatMul, &["x", "w_again"]),
    ];
    for layer in layers {
        model.add_layer(layer).unwrap();
    }
    model.add_output("out");
    model
}

#[allow(dead_code)]
pub fn mlp_feeds() -> HashMap<String, Tensor> {
    HashMap::from([("x".to_string(), ramp(&[3, 4], 0.0))])
}

/// Optimizes at `level` with link validation after every pass.
#[allow(dead_code)]
pub fn optimize(model: &mut Model, level: OptLevel) {
    PassManager::for_level(level)
        .with_validation(true)
        .run(model)
        .expect("optimization failed");
}

/// Loose float comparison for results of rewritten graphs.
#[allow(dead_code)]
pub fn assert_close(actual: &Tensor, expected: &Tensor) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.as_f32().unwrap().iter().zip(expected.as_f32().unwrap()) {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "{a} vs {e}");
    }
}
