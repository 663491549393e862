use std::collections::HashMap;

use lumen_ir::{Activation, DataType, Layer, Model, Op, SymbolicTensorShape, Tensor, TensorShape};
use lumen_opt::{
    ContractSubExpressionPass, CpuFallbackPass, EinsumToMatMulPass, FuseActivationsPass,
    FuseConstantsPass, FuseDensePass, FuseLinearLayersPass, OptLevel, Pass, PassManager,
    RemoveDuplicateConstantsPass, RemoveDuplicateLayersPass, RemoveNoOpsPass, RemoveUnusedPass,
    RoundDenormalWeightsPass, ValidateBrokenLinksPass, ValidateUniqueOutputsPass,
};

fn static_input(model: &mut Model, name: &str, dims: &[usize]) {
    model
        .add_input(
            name,
            DataType::Float,
            SymbolicTensorShape::from(TensorShape::new(dims).unwrap()),
        )
        .unwrap();
}

fn ramp(dims: &[usize], offset: f32) -> Tensor {
    let n = dims.iter().product::<usize>();
    Tensor::from_f32(dims, (0..n).map(|i| (i as f32 * 0.61 + offset).cos()).collect()).unwrap()
}

/// Exercises every cleanup and fusion pass at least once.
fn mixed_model() -> Model {
    let mut model = Model::new();
    static_input(&mut model, "x", &[2, 4]);
    model.add_constant("two", &Tensor::scalar_f32(2.0)).unwrap();
    model.add_constant("three", &Tensor::scalar_f32(3.0)).unwrap();
    model.add_constant("w", &ramp(&[4, 3], 0.5)).unwrap();
    model.add_constant("b", &ramp(&[3], 2.0)).unwrap();

    let layers = [
        Layer::new("k", Op::Add, &["two", "three"]),
        Layer::new("m", Op::Mul, &["x", "k"]),
        Layer::new("id", Op::Identity, &["m"]),
        Layer::new("mm", Op::MatMul, &["id", "w"]),
        Layer::new("add", Op::Add, &["mm", "b"]),
        Layer::new("r", Op::Relu, &["add"]),
        Layer::new("e1", Op::Exp, &["r"]),
        Layer::new("e2", Op::Exp, &["r"]),
        Layer::new("s", Op::Add, &["e1", "e2"]),
        Layer::new("sig", Op::Sigmoid, &["s"]),
        Layer::new("sw", Op::Mul, &["s", "sig"]),
        Layer::new("dead", Op::Neg, &["x"]),
    ];
    for layer in layers {
        model.add_layer(layer).unwrap();
    }
    model.add_output("sw");
    model
}

fn feeds() -> HashMap<String, Tensor> {
    HashMap::from([("x".to_string(), ramp(&[2, 4], 0.0))])
}

fn assert_close(actual: &Tensor, expected: &Tensor) {
    assert_eq!(actual.shape(), expected.shape());
    for (a, e) in actual.as_f32().unwrap().iter().zip(expected.as_f32().unwrap()) {
        assert!((a - e).abs() <= 1e-4 * e.abs().max(1.0), "{a} vs {e}");
    }
}

fn all_passes() -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(ValidateBrokenLinksPass),
        Box::new(EinsumToMatMulPass),
        Box::new(FuseConstantsPass),
        Box::new(RemoveNoOpsPass),
        Box::new(RemoveDuplicateLayersPass),
        Box::new(ContractSubExpressionPass::new()),
        Box::new(FuseDensePass),
        Box::new(FuseLinearLayersPass),
        Box::new(FuseActivationsPass),
        Box::new(RemoveDuplicateConstantsPass),
        Box::new(RemoveUnusedPass),
        Box::new(RoundDenormalWeightsPass),
        Box::new(CpuFallbackPass),
        Box::new(ValidateUniqueOutputsPass),
    ]
}

#[test]
fn full_pipeline_preserves_results() {
    let mut model = mixed_model();
    let expected = lumen_cpu::run_model(&model, &feeds()).unwrap();

    let changed = PassManager::for_level(OptLevel::O2)
        .with_validation(true)
        .run(&mut model)
        .unwrap();
    assert!(changed);

    let actual = lumen_cpu::run_model(&model, &feeds()).unwrap();
    assert_close(&actual["sw"], &expected["sw"]);

    let ops: Vec<&str> = model.layers.iter().map(|l| l.op.op_type()).collect();
    assert_eq!(ops, ["ScalarMad", "Dense", "Exp", "Add", "Swish"]);
    let dense = model.layer("r").unwrap();
    assert_eq!(dense.op.activation(), Some(Activation::Relu));
    assert!(model.constant("two").is_none());
    assert!(model.layer("dead").is_none());
}

#[test]
fn pipeline_is_idempotent() {
    let mut model = mixed_model();
    let pm = PassManager::for_level(OptLevel::O2).with_validation(true);
    pm.run(&mut model).unwrap();
    assert!(!pm.run(&mut model).unwrap());
}

#[test]
fn every_pass_is_idempotent() {
    for pass in all_passes() {
        let mut model = mixed_model();
        pass.run(&mut model).unwrap();
        assert!(
            !pass.run(&mut model).unwrap(),
            "{} changed the model twice",
            pass.name()
        );
    }
}

#[test]
fn o1_folds_but_does_not_fuse() {
    let mut model = mixed_model();
    PassManager::for_level(OptLevel::O1)
        .with_validation(true)
        .run(&mut model)
        .unwrap();
    assert!(model.constant("k").is_some());
    assert!(model.layer("mm").is_some());
    assert!(model.layer("id").is_none());
    assert!(model.layer("e2").is_none());
}

#[test]
fn relu_with_shared_producer_is_not_fused() {
    let mut model = Model::new();
    static_input(&mut model, "x", &[1, 1, 2, 2]);
    model
        .add_constant("w", &Tensor::from_f32(&[1, 1, 1, 1], vec![-2.0]).unwrap())
        .unwrap();
    let conv = Op::Conv {
        strides: [1, 1],
        pads: [0; 4],
        dilations: [1, 1],
        group: 1,
        activation: Activation::None,
    };
    model.add_layer(Layer::new("conv", conv, &["x", "w"])).unwrap();
    model.add_layer(Layer::new("relu", Op::Relu, &["conv"])).unwrap();
    model.add_layer(Layer::new("exp", Op::Exp, &["relu"])).unwrap();
    model
        .add_layer(Layer::new("cat", Op::Concat { axis: 1 }, &["relu", "conv"]))
        .unwrap();
    model.add_output("exp");
    model.add_output("cat");

    let feeds = HashMap::from([("x".to_string(), ramp(&[1, 1, 2, 2], 0.0))]);
    let expected = lumen_cpu::run_model(&model, &feeds).unwrap();
    lumen_opt::optimize(&mut model).unwrap();

    assert_eq!(model.layer("relu").unwrap().op, Op::Relu);
    assert_eq!(model.layer("conv").unwrap().op.activation(), Some(Activation::None));
    let actual = lumen_cpu::run_model(&model, &feeds).unwrap();
    assert_close(&actual["cat"], &expected["cat"]);
    assert_close(&actual["exp"], &expected["exp"]);
}

#[test]
fn einsum_with_constant_weights_becomes_dense() {
    let mut model = Model::new();
    static_input(&mut model, "a", &[2, 3]);
    model.add_constant("w", &ramp(&[3, 4], 1.0)).unwrap();
    model
        .add_layer(Layer::new(
            "e",
            Op::Einsum {
                equation: "ij,jk->ik".into(),
            },
            &["a", "w"],
        ))
        .unwrap();
    model.add_output("e");

    let feeds = HashMap::from([("a".to_string(), ramp(&[2, 3], 0.0))]);
    let expected = lumen_cpu::run_model(&model, &feeds).unwrap();
    lumen_opt::optimize(&mut model).unwrap();

    assert_eq!(model.layers.len(), 1);
    assert!(matches!(model.layers[0].op, Op::Dense { .. }));
    let actual = lumen_cpu::run_model(&model, &feeds).unwrap();
    assert_close(&actual["e"], &expected["e"]);
}

#[test]
fn constant_expression_folds_to_one_constant() {
    let mut model = Model::new();
    model.add_constant("c", &Tensor::scalar_f32(2.0)).unwrap();
    model.add_constant("d", &Tensor::scalar_f32(3.0)).unwrap();
    model.add_layer(Layer::new("sum", Op::Add, &["c", "d"])).unwrap();
    model.add_output("sum");

    lumen_opt::optimize(&mut model).unwrap();
    assert!(model.layers.is_empty());
    assert_eq!(model.constants.len(), 1);
    assert_eq!(model.constant_tensor("sum").unwrap(), Tensor::scalar_f32(5.0));
}

#[test]
fn broken_link_is_reported_with_pass_name() {
    let mut model = Model::new();
    model.layers.push(Layer::new("y", Op::Exp, &["missing"]));
    model.add_output("y");
    let err = lumen_opt::optimize(&mut model).unwrap_err();
    assert_eq!(err.pass, "validate-broken-links");
    assert!(err.to_string().contains("missing"));
}

#[test]
fn huge_shape_producers_are_left_in_place() {
    let mut model = Model::new();
    static_input(&mut model, "x", &[1, 1]);
    model
        .add_constant("s", &Tensor::from_i32(&[2], vec![1 << 20, 1 << 20]).unwrap())
        .unwrap();
    model
        .add_layer(Layer::new("fill", Op::ConstantOfShape { value: 1.0 }, &["s"]))
        .unwrap();
    model.add_layer(Layer::new("wide", Op::Expand, &["x", "s"])).unwrap();
    model.add_output("fill");
    model.add_output("wide");

    PassManager::for_level(OptLevel::O2)
        .with_validation(true)
        .run(&mut model)
        .unwrap();

    let ops: Vec<&str> = model.layers.iter().map(|l| l.op.op_type()).collect();
    assert_eq!(ops, ["ConstantOfShape", "Expand"]);
    assert!(!model.is_constant("fill"));
    assert!(!model.is_constant("wide"));
    assert_eq!(model.weights.iter().map(Vec::len).sum::<usize>(), 8);
}
