use std::collections::HashMap;

use lumen_cpu::{ExecError, execute, run_model};
use lumen_ir::{
    Activation, DataType, Layer, Model, Op, SymbolicTensorShape, Tensor, TensorShape,
};

fn input_model(dims: &[usize]) -> Model {
    let mut model = Model::new();
    model
        .add_input(
            "x",
            DataType::Float,
            SymbolicTensorShape::from(TensorShape::new(dims).unwrap()),
        )
        .unwrap();
    model
}

#[test]
fn dense_relu_chain() {
    let mut model = input_model(&[1, 2]);
    model
        .add_constant("w", &Tensor::from_f32(&[2, 2], vec![1.0, -1.0, 1.0, -1.0]).unwrap())
        .unwrap();
    model
        .add_constant("b", &Tensor::from_f32(&[2], vec![0.5, 0.5]).unwrap())
        .unwrap();
    model
        .add_layer(Layer::new(
            "y",
            Op::Dense {
                activation: Activation::Relu,
            },
            &["x", "w", "b"],
        ))
        .unwrap();
    model.add_output("y");

    let feeds = HashMap::from([(
        "x".to_string(),
        Tensor::from_f32(&[1, 2], vec![1.0, 2.0]).unwrap(),
    )]);
    let out = run_model(&model, &feeds).unwrap();
    assert_eq!(out["y"].as_f32().unwrap(), &[3.5, 0.0]);
}

#[test]
fn shape_subgraph_on_ints() {
    let mut model = input_model(&[2, 3, 4]);
    model
        .add_constant("idx", &Tensor::from_i32(&[1], vec![0]).unwrap())
        .unwrap();
    model
        .add_constant("minus_one", &Tensor::from_i32(&[1], vec![-1]).unwrap())
        .unwrap();
    model.add_layer(Layer::new("s", Op::Shape, &["x"])).unwrap();
    model
        .add_layer(Layer::new("n", Op::Gather { axis: 0 }, &["s", "idx"]))
        .unwrap();
    model
        .add_layer(Layer::new("target", Op::Concat { axis: 0 }, &["n", "minus_one"]))
        .unwrap();
    model
        .add_layer(Layer::new("r", Op::Reshape { allow_zero: false }, &["x", "target"]))
        .unwrap();
    model.add_output("r");

    let feeds = HashMap::from([(
        "x".to_string(),
        Tensor::from_f32(&[2, 3, 4], vec![0.0; 24]).unwrap(),
    )]);
    let out = run_model(&model, &feeds).unwrap();
    assert_eq!(out["r"].shape().dims(), &[2, 12]);
}

#[test]
fn missing_feed_is_reported() {
    let mut model = input_model(&[1]);
    model.add_layer(Layer::new("y", Op::Relu, &["x"])).unwrap();
    model.add_output("y");
    let err = run_model(&model, &HashMap::new()).unwrap_err();
    assert!(matches!(err, ExecError::UnknownValue(name) if name == "x"));
}

#[test]
fn split_produces_every_output() {
    let x = Tensor::from_f32(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let outs = execute(
        &Op::Split {
            axis: 1,
            sizes: vec![1, 1],
        },
        &[Some(&x)],
    )
    .unwrap();
    assert_eq!(outs.len(), 2);
    assert_eq!(outs[0].as_f32().unwrap(), &[1.0, 3.0]);
    assert_eq!(outs[1].as_f32().unwrap(), &[2.0, 4.0]);
}

#[test]
fn attention_with_uniform_scores_averages_values() {
    let q = Tensor::from_f32(&[1, 2], vec![0.0, 0.0]).unwrap();
    let k = Tensor::from_f32(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let v = Tensor::from_f32(&[2, 1], vec![2.0, 4.0]).unwrap();
    let out = execute(
        &Op::ScaledDotProductAttention { scale: 1.0 },
        &[Some(&q), Some(&k), Some(&v)],
    )
    .unwrap();
    assert!((out[0].as_f32().unwrap()[0] - 3.0).abs() < 1e-6);
}
