//! Per-op inference rules over partial tensors.

use lumen_ir::{
    DataType, EinsumEquation, IrError, Op, SymbolicDim, SymbolicTensorShape, TensorShape,
    normalize_axis,
};

use crate::partial::{MAX_TRACKED_ELEMENTS, PartialElement, PartialTensor};

/// Why a rule rejected its inputs.
#[derive(Debug)]
pub(crate) enum RuleError {
    Ir(IrError),
    Invalid(String),
}

impl From<IrError> for RuleError {
    fn from(e: IrError) -> Self {
        Self::Ir(e)
    }
}

type RuleResult = Result<Vec<PartialTensor>, RuleError>;

fn invalid<T>(message: impl Into<String>) -> Result<T, RuleError> {
    Err(RuleError::Invalid(message.into()))
}

/// Applies the inference rule of `op`. Empty input slots are `None`.
///
/// Layers with fully known inputs are executed only when the symbolic rule
/// proves every output small enough to track.
pub(crate) fn infer(op: &Op, inputs: &[Option<PartialTensor>]) -> RuleResult {
    let symbolic = infer_symbolic(op, inputs)?;
    let present: Vec<&PartialTensor> = inputs.iter().flatten().collect();
    if !op.is_non_deterministic()
        && !present.is_empty()
        && present.iter().all(|p| p.is_fully_known())
        && !symbolic.iter().all(PartialTensor::is_fully_known)
        && symbolic.iter().all(is_trackable)
        && let Some(outputs) = evaluate(op, inputs)?
    {
        return Ok(outputs);
    }
    Ok(symbolic)
}

fn is_trackable(p: &PartialTensor) -> bool {
    p.static_shape()
        .is_some_and(|s| s.length() <= MAX_TRACKED_ELEMENTS)
}

/// Runs the op on fully known inputs.
fn evaluate(op: &Op, inputs: &[Option<PartialTensor>]) -> Result<Option<Vec<PartialTensor>>, RuleError> {
    let tensors: Vec<Option<lumen_ir::Tensor>> = inputs
        .iter()
        .map(|p| p.as_ref().and_then(PartialTensor::to_tensor))
        .collect();
    let args: Vec<Option<&lumen_ir::Tensor>> = tensors.iter().map(Option::as_ref).collect();
    match lumen_cpu::execute(op, &args) {
        Ok(outputs) => Ok(Some(outputs.iter().map(PartialTensor::from_tensor).collect())),
        Err(lumen_cpu::ExecError::Unsupported { .. }) => Ok(None),
        Err(e) => invalid(e.to_string()),
    }
}

fn arg(inputs: &[Option<PartialTensor>], index: usize) -> PartialTensor {
    inputs
        .get(index)
        .cloned()
        .flatten()
        .unwrap_or_else(|| PartialTensor::unknown(DataType::Float))
}

fn one(p: PartialTensor) -> RuleResult {
    Ok(vec![p])
}

fn float_of(shape: SymbolicTensorShape) -> PartialTensor {
    PartialTensor::from_shape(DataType::Float, shape)
}

fn infer_symbolic(op: &Op, inputs: &[Option<PartialTensor>]) -> RuleResult {
    let x = arg(inputs, 0);
    match op {
        Op::Identity => one(x),
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Pow => binary(op, &x, &arg(inputs, 1)),
        Op::Neg if x.data_type() == DataType::Int => one(PartialTensor::from_shape(
            DataType::Int,
            x.shape().clone(),
        )),
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
        | Op::ScalarMad { .. }
        | Op::Softmax { .. }
        | Op::BatchNormalization { .. }
        | Op::ScaleBias
        | Op::LayerNormalization { .. } => one(float_of(x.shape().clone())),
        Op::MatMul | Op::Dense { .. } => one(float_of(matmul_shape(x.shape(), arg(inputs, 1).shape())?)),
        Op::Conv {
            strides,
            pads,
            dilations,
            ..
        } => one(float_of(conv_shape(
            x.shape(),
            arg(inputs, 1).shape(),
            *strides,
            *pads,
            *dilations,
        )?)),
        Op::ReduceMean { axes, keep_dims } | Op::ReduceSum { axes, keep_dims } => {
            let Some(dims) = x.shape().dims() else {
                return one(float_of(SymbolicTensorShape::unknown_rank()));
            };
            let axes = lumen_cpu::reduce_axes(axes, dims.len())?;
            let out = dims
                .iter()
                .enumerate()
                .filter_map(|(i, &d)| match (axes.contains(&i), *keep_dims) {
                    (false, _) => Some(d),
                    (true, true) => Some(SymbolicDim::Value(1)),
                    (true, false) => None,
                })
                .collect();
            one(float_of(SymbolicTensorShape::from_dims(out)))
        }
        Op::Reshape { allow_zero } => reshape(&x, &arg(inputs, 1), *allow_zero),
        Op::Transpose { perm } => {
            let Some(dims) = x.shape().dims() else {
                return one(PartialTensor::unknown(x.data_type()));
            };
            let perm = lumen_cpu::transpose_perm(perm.as_deref(), dims.len());
            if perm.len() != dims.len() || perm.iter().any(|&p| p >= dims.len()) {
                return invalid(format!("permutation {perm:?} does not match rank {}", dims.len()));
            }
            let out = SymbolicTensorShape::from_dims(perm.iter().map(|&p| dims[p]).collect());
            match x.elements() {
                Some(elements) if dims.len() <= 1 => one(PartialTensor::with_elements(
                    x.data_type(),
                    out,
                    elements.to_vec(),
                )),
                _ => one(PartialTensor::from_shape(x.data_type(), out)),
            }
        }
        Op::Concat { axis } => {
            let parts: Vec<&PartialTensor> = inputs.iter().flatten().collect();
            concat(&parts, *axis)
        }
        Op::Split { axis, sizes } => {
            let Some(dims) = x.shape().dims() else {
                return Ok(vec![PartialTensor::unknown(x.data_type()); op.num_outputs()]);
            };
            let axis = normalize_axis(*axis, dims.len())?;
            if sizes.is_empty() {
                return one(x);
            }
            Ok(sizes
                .iter()
                .map(|&size| {
                    let mut out = dims.to_vec();
                    out[axis] = SymbolicDim::Value(size);
                    PartialTensor::from_shape(x.data_type(), SymbolicTensorShape::from_dims(out))
                })
                .collect())
        }
        Op::Shape => {
            let Some(dims) = x.shape().dims() else {
                return one(PartialTensor::from_shape(
                    DataType::Int,
                    SymbolicTensorShape::unknown_of_rank(1),
                ));
            };
            one(PartialTensor::with_elements(
                DataType::Int,
                SymbolicTensorShape::from_dims(vec![SymbolicDim::Value(dims.len())]),
                dims.iter().map(|&d| PartialElement::from_dim(d)).collect(),
            ))
        }
        Op::Gather { axis } => gather(&x, &arg(inputs, 1), *axis),
        Op::Expand => {
            let target = match arg(inputs, 1).as_dims() {
                Some(dims) => SymbolicTensorShape::from_dims(dims),
                None => SymbolicTensorShape::unknown_rank(),
            };
            one(PartialTensor::from_shape(x.data_type(), x.shape().broadcast(&target)?))
        }
        Op::ConstantOfShape { value } => {
            let Some(dims) = x.as_dims() else {
                return one(float_of(SymbolicTensorShape::unknown_rank()));
            };
            let shape = SymbolicTensorShape::from_dims(dims);
            match shape.length().value() {
                Some(length) if length <= MAX_TRACKED_ELEMENTS => one(PartialTensor::with_elements(
                    DataType::Float,
                    shape,
                    vec![PartialElement::Float(*value); length],
                )),
                _ => one(float_of(shape)),
            }
        }
        Op::Einsum { equation } => einsum(equation, inputs),
        Op::RandomNormal { shape, .. } => {
            one(float_of(SymbolicTensorShape::from(TensorShape::new(shape)?)))
        }
        Op::ScaledDotProductAttention { .. } => {
            let v = arg(inputs, 2);
            let out = match x.shape().dims() {
                Some(dims) if !dims.is_empty() => {
                    let mut out = dims.to_vec();
                    let last = out.len() - 1;
                    out[last] = v.shape().get(-1);
                    SymbolicTensorShape::from_dims(out)
                }
                _ => SymbolicTensorShape::unknown_rank(),
            };
            one(float_of(out))
        }
    }
}

/// Maps an output coordinate to the flat index of a right-aligned
/// broadcast input.
fn broadcast_index(out: &TensorShape, input: &TensorShape, index: usize) -> usize {
    let coords = out.unravel(index);
    let offset = out.rank() - input.rank();
    let mut flat = 0;
    for (axis, &dim) in input.dims().iter().enumerate() {
        let c = if dim == 1 { 0 } else { coords[offset + axis] };
        flat = flat * dim + c;
    }
    flat
}

fn binary_element(op: &Op, a: PartialElement, b: PartialElement) -> PartialElement {
    use PartialElement::{Float, Int, Param, Unknown};
    match (op, a, b) {
        (Op::Add, Int(x), Int(y)) => Int(x.wrapping_add(y)),
        (Op::Sub, Int(x), Int(y)) => Int(x.wrapping_sub(y)),
        (Op::Mul, Int(x), Int(y)) => Int(x.wrapping_mul(y)),
        (Op::Div, Int(x), Int(y)) if y != 0 => Int(x.wrapping_div(y)),
        (Op::Add | Op::Sub, p @ Param(_), Int(0))
        | (Op::Add, Int(0), p @ Param(_))
        | (Op::Mul | Op::Div, p @ Param(_), Int(1))
        | (Op::Mul, Int(1), p @ Param(_)) => p,
        (Op::Mul, _, Int(0)) | (Op::Mul, Int(0), _) => Int(0),
        (_, Float(_), _) | (_, _, Float(_)) => match (a.as_f32(), b.as_f32()) {
            (Some(x), Some(y)) => Float(match op {
                Op::Add => x + y,
                Op::Sub => x - y,
                Op::Mul => x * y,
                Op::Div => x / y,
                _ => x.powf(y),
            }),
            _ => Unknown,
        },
        _ => Unknown,
    }
}

fn binary(op: &Op, a: &PartialTensor, b: &PartialTensor) -> RuleResult {
    let data_type = if a.data_type() == DataType::Int && b.data_type() == DataType::Int && *op != Op::Pow {
        DataType::Int
    } else {
        DataType::Float
    };
    let shape = a.shape().broadcast(b.shape())?;
    let (Some(ea), Some(eb), Some(out), Some(sa), Some(sb)) = (
        a.elements(),
        b.elements(),
        shape.to_shape(),
        a.static_shape(),
        b.static_shape(),
    ) else {
        return one(PartialTensor::from_shape(data_type, shape));
    };
    if out.length() > MAX_TRACKED_ELEMENTS {
        return one(PartialTensor::from_shape(data_type, shape));
    }
    let elements = (0..out.length())
        .map(|i| {
            binary_element(
                op,
                ea[broadcast_index(&out, &sa, i)],
                eb[broadcast_index(&out, &sb, i)],
            )
        })
        .collect();
    one(PartialTensor::with_elements(data_type, shape, elements))
}

fn matmul_shape(
    a: &SymbolicTensorShape,
    b: &SymbolicTensorShape,
) -> Result<SymbolicTensorShape, RuleError> {
    let (Some(ad), Some(bd)) = (a.dims(), b.dims()) else {
        return Ok(SymbolicTensorShape::unknown_rank());
    };
    if ad.is_empty() || bd.is_empty() {
        return invalid("matrix product of a scalar");
    }
    let (m, k) = if ad.len() == 1 {
        (None, ad[0])
    } else {
        (Some(ad[ad.len() - 2]), ad[ad.len() - 1])
    };
    let (k2, n) = if bd.len() == 1 {
        (bd[0], None)
    } else {
        (bd[bd.len() - 2], Some(bd[bd.len() - 1]))
    };
    if let (SymbolicDim::Value(x), SymbolicDim::Value(y)) = (k, k2)
        && x != y
    {
        return invalid(format!("inner dimensions {x} and {y} differ"));
    }
    let batch_a = SymbolicTensorShape::from_dims(ad[..ad.len().saturating_sub(2)].to_vec());
    let batch_b = SymbolicTensorShape::from_dims(bd[..bd.len().saturating_sub(2)].to_vec());
    let batch = batch_a.broadcast(&batch_b)?;
    let mut dims = batch.dims().map(<[SymbolicDim]>::to_vec).unwrap_or_default();
    dims.extend(m);
    dims.extend(n);
    Ok(SymbolicTensorShape::from_dims(dims))
}

fn conv_shape(
    x: &SymbolicTensorShape,
    w: &SymbolicTensorShape,
    strides: [usize; 2],
    pads: [usize; 4],
    dilations: [usize; 2],
) -> Result<SymbolicTensorShape, RuleError> {
    if x.rank().is_some_and(|r| r != 4) || w.rank().is_some_and(|r| r != 4) {
        return invalid("convolution expects rank-4 input and weights");
    }
    let spatial = |axis: usize| -> Result<SymbolicDim, RuleError> {
        match (x.get(axis as isize + 2).value(), w.get(axis as isize + 2).value()) {
            (Some(input), Some(kernel)) => lumen_cpu::conv_output_size(
                input,
                kernel,
                strides[axis],
                pads[axis] + pads[axis + 2],
                dilations[axis],
            )
            .map(SymbolicDim::Value)
            .ok_or_else(|| RuleError::Invalid("kernel larger than padded input".to_string())),
            _ => Ok(SymbolicDim::Unknown),
        }
    };
    Ok(SymbolicTensorShape::from_dims(vec![
        x.get(0),
        w.get(0),
        spatial(0)?,
        spatial(1)?,
    ]))
}

fn reshape(x: &PartialTensor, target: &PartialTensor, allow_zero: bool) -> RuleResult {
    let Some(elements) = target.elements().map(<[PartialElement]>::to_vec).or_else(|| {
        target
            .as_dims()
            .map(|dims| dims.into_iter().map(PartialElement::from_dim).collect())
    }) else {
        return one(PartialTensor::unknown(x.data_type()));
    };
    let mut dims = Vec::with_capacity(elements.len());
    let mut inferred = None;
    for (i, element) in elements.iter().enumerate() {
        let dim = match element {
            PartialElement::Int(0) if !allow_zero => x.shape().get(i as isize),
            PartialElement::Int(-1) if inferred.is_none() => {
                inferred = Some(i);
                SymbolicDim::Unknown
            }
            PartialElement::Int(v) if *v < 0 => return invalid(format!("invalid target dimension {v}")),
            other => other.to_dim(),
        };
        dims.push(dim);
    }
    if let Some(i) = inferred {
        let known = dims
            .iter()
            .enumerate()
            .filter(|&(j, _)| j != i)
            .fold(SymbolicDim::Value(1), |acc, (_, &d)| acc.mul(d));
        dims[i] = match (x.shape().length(), known) {
            (SymbolicDim::Value(total), SymbolicDim::Value(part)) if part > 0 => {
                if total % part != 0 {
                    return invalid(format!("cannot reshape {total} elements into {part}-sized groups"));
                }
                SymbolicDim::Value(total / part)
            }
            (total, SymbolicDim::Value(1)) => total,
            _ => SymbolicDim::Unknown,
        };
    }
    let shape = SymbolicTensorShape::from_dims(dims);
    if let (SymbolicDim::Value(a), SymbolicDim::Value(b)) = (x.shape().length(), shape.length())
        && a != b
    {
        return invalid(format!("{} cannot be reshaped to {shape}", x.shape()));
    }
    match x.elements() {
        Some(elements) => one(PartialTensor::with_elements(
            x.data_type(),
            shape,
            elements.to_vec(),
        )),
        None => one(PartialTensor::from_shape(x.data_type(), shape)),
    }
}

fn concat(parts: &[&PartialTensor], axis: isize) -> RuleResult {
    let Some(first) = parts.first() else {
        return invalid("concatenation of nothing");
    };
    let data_type = first.data_type();
    let ranks: Option<Vec<&[SymbolicDim]>> = parts.iter().map(|p| p.shape().dims()).collect();
    let Some(ranks) = ranks else {
        return one(PartialTensor::unknown(data_type));
    };
    let rank = ranks[0].len();
    if ranks.iter().any(|d| d.len() != rank) {
        return invalid("concatenated tensors differ in rank");
    }
    let axis = normalize_axis(axis, rank)?;
    let mut dims = ranks[0].to_vec();
    for other in &ranks[1..] {
        for (i, d) in dims.iter_mut().enumerate() {
            *d = if i == axis { d.add(other[i]) } else { d.merge(other[i]) };
        }
    }
    let shape = SymbolicTensorShape::from_dims(dims);

    let elements: Option<Vec<&[PartialElement]>> = parts.iter().map(|p| p.elements()).collect();
    let shapes: Option<Vec<TensorShape>> = parts.iter().map(|p| p.static_shape()).collect();
    let (Some(elements), Some(shapes)) = (elements, shapes) else {
        return one(PartialTensor::from_shape(data_type, shape));
    };
    let outer = shapes[0].length_range(0, axis);
    let mut out = Vec::new();
    for o in 0..outer {
        for (part, s) in elements.iter().zip(&shapes) {
            let block = s.length_range(axis, rank);
            out.extend_from_slice(&part[o * block..(o + 1) * block]);
        }
    }
    one(PartialTensor::with_elements(data_type, shape, out))
}

fn gather(data: &PartialTensor, indices: &PartialTensor, axis: isize) -> RuleResult {
    let (Some(dd), Some(id)) = (data.shape().dims(), indices.shape().dims()) else {
        return one(PartialTensor::unknown(data.data_type()));
    };
    let axis = normalize_axis(axis, dd.len())?;
    let mut dims = dd[..axis].to_vec();
    dims.extend_from_slice(id);
    dims.extend_from_slice(&dd[axis + 1..]);
    let shape = SymbolicTensorShape::from_dims(dims);

    // Element selection is tracked for gathers from 1-D tensors.
    let picks: Option<Vec<i64>> = indices
        .elements()
        .and_then(|e| e.iter().map(|x| x.as_i64()).collect());
    match (data.elements(), picks, dd) {
        (Some(elements), Some(picks), [SymbolicDim::Value(n)]) => {
            let n = *n as i64;
            let mut out = Vec::with_capacity(picks.len());
            for i in picks {
                let wrapped = if i < 0 { i + n } else { i };
                if !(0..n).contains(&wrapped) {
                    return invalid(format!("index {i} out of range for {n}"));
                }
                out.push(elements[wrapped as usize]);
            }
            one(PartialTensor::with_elements(data.data_type(), shape, out))
        }
        _ => one(PartialTensor::from_shape(data.data_type(), shape)),
    }
}

fn einsum(equation: &str, inputs: &[Option<PartialTensor>]) -> RuleResult {
    let eq = EinsumEquation::parse(equation)?;
    let operands: Vec<PartialTensor> = inputs.iter().flatten().cloned().collect();
    if operands.len() != eq.operands.len() {
        return invalid(format!(
            "{} operands for {} tensors",
            eq.operands.len(),
            operands.len()
        ));
    }
    let mut sizes: std::collections::HashMap<char, SymbolicDim> = std::collections::HashMap::new();
    for (labels, operand) in eq.operands.iter().zip(&operands) {
        let Some(dims) = operand.shape().dims() else {
            continue;
        };
        if dims.len() != labels.len() {
            return invalid(format!("operand rank {} does not match labels", dims.len()));
        }
        for (&label, &dim) in labels.iter().zip(dims) {
            let entry = sizes.entry(label).or_insert(SymbolicDim::Unknown);
            if let (SymbolicDim::Value(a), SymbolicDim::Value(b)) = (*entry, dim)
                && a != b
            {
                return invalid(format!("label '{label}' bound to {a} and {b}"));
            }
            *entry = entry.merge(dim);
        }
    }
    let dims = eq
        .output
        .iter()
        .map(|c| sizes.get(c).copied().unwrap_or(SymbolicDim::Unknown))
        .collect();
    one(float_of(SymbolicTensorShape::from_dims(dims)))
}
