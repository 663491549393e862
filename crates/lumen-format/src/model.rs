//! Model <-> `ModelProto` conversion.

use lumen_ir::{
    Constant, DataType, Layer, LayerFlags, Model, ModelInput, ModelWarning, Severity, SymbolicDim,
    SymbolicTensorShape, TensorShape, WeightRegion,
};

use crate::error::FormatError;
use crate::op::{decode_op, encode_op};
use crate::proto::{
    ConstantProto, DimProto, InputProto, LayerProto, ModelProto, WarningProto, data_type, dim_kind,
};
use crate::FORMAT_VERSION;

fn invalid(name: &str, reason: impl Into<String>) -> FormatError {
    FormatError::Invalid {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn encode_data_type(dt: DataType) -> i32 {
    match dt {
        DataType::Float => data_type::FLOAT,
        DataType::Int => data_type::INT,
    }
}

fn decode_data_type(name: &str, code: i32) -> Result<DataType, FormatError> {
    match code {
        data_type::FLOAT => Ok(DataType::Float),
        data_type::INT => Ok(DataType::Int),
        _ => Err(invalid(name, format!("unknown data type {code}"))),
    }
}

fn encode_severity(severity: Severity) -> i32 {
    match severity {
        Severity::None => 0,
        Severity::Info => 1,
        Severity::Warning => 2,
        Severity::Error => 3,
    }
}

fn decode_severity(code: i32) -> Severity {
    match code {
        1 => Severity::Info,
        2 => Severity::Warning,
        3 => Severity::Error,
        _ => Severity::None,
    }
}

fn single_char(name: &str, s: &str) -> Result<char, FormatError> {
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(invalid(name, format!("'{s}' is not a single-character dimension name"))),
    }
}

fn encode_input(input: &ModelInput) -> InputProto {
    let dims = input.shape.dims().unwrap_or_default();
    InputProto {
        name: input.name.clone(),
        data_type: encode_data_type(input.data_type),
        has_rank: input.shape.rank().is_some(),
        dims: dims
            .iter()
            .map(|d| match *d {
                SymbolicDim::Unknown => DimProto {
                    kind: dim_kind::UNKNOWN,
                    ..Default::default()
                },
                SymbolicDim::Value(v) => DimProto {
                    kind: dim_kind::VALUE,
                    value: v as u64,
                    ..Default::default()
                },
                SymbolicDim::Param(c) => DimProto {
                    kind: dim_kind::PARAM,
                    param: c.to_string(),
                    ..Default::default()
                },
            })
            .collect(),
    }
}

fn decode_input(proto: &InputProto) -> Result<ModelInput, FormatError> {
    let name = proto.name.as_str();
    let shape = if proto.has_rank {
        let dims = proto
            .dims
            .iter()
            .map(|d| match d.kind {
                dim_kind::UNKNOWN => Ok(SymbolicDim::Unknown),
                dim_kind::VALUE => usize::try_from(d.value)
                    .map(SymbolicDim::Value)
                    .map_err(|_| invalid(name, "dimension does not fit in usize")),
                dim_kind::PARAM => single_char(name, &d.param).map(SymbolicDim::Param),
                other => Err(invalid(name, format!("unknown dimension kind {other}"))),
            })
            .collect::<Result<Vec<_>, _>>()?;
        SymbolicTensorShape::from_dims(dims)
    } else {
        SymbolicTensorShape::unknown_rank()
    };
    Ok(ModelInput {
        name: proto.name.clone(),
        data_type: decode_data_type(name, proto.data_type)?,
        shape,
    })
}

fn encode_layer(layer: &Layer) -> LayerProto {
    LayerProto {
        name: layer.name.clone(),
        op_type: layer.op.op_type().to_string(),
        inputs: layer.inputs.clone(),
        outputs: layer.outputs.clone(),
        flags: layer.flags.bits(),
        attributes: encode_op(&layer.op),
    }
}

fn decode_layer(proto: &LayerProto) -> Result<Layer, FormatError> {
    let op = decode_op(&proto.name, &proto.op_type, &proto.attributes)?;
    if proto.outputs.len() + 1 != op.num_outputs() {
        return Err(invalid(&proto.name, "output count does not match the op"));
    }
    Ok(Layer {
        name: proto.name.clone(),
        inputs: proto.inputs.clone(),
        outputs: proto.outputs.clone(),
        flags: LayerFlags::from_bits_truncate(proto.flags),
        op,
    })
}

fn encode_constant(constant: &Constant) -> ConstantProto {
    ConstantProto {
        name: constant.name.clone(),
        data_type: encode_data_type(constant.data_type),
        dims: constant.shape.dims().iter().map(|&d| d as u64).collect(),
        chunk: constant.region.chunk as u32,
        offset: constant.region.offset as u64,
        element_count: constant.shape.length() as u64,
    }
}

fn decode_constant(proto: &ConstantProto, model: &Model) -> Result<Constant, FormatError> {
    let name = proto.name.as_str();
    let data_type = decode_data_type(name, proto.data_type)?;
    let dims = proto
        .dims
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| invalid(name, "dimension does not fit in usize")))
        .collect::<Result<Vec<_>, _>>()?;
    let length = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| invalid(name, "element count overflows"))?;
    if length as u64 != proto.element_count {
        return Err(invalid(
            name,
            format!("element count {} does not match its shape", proto.element_count),
        ));
    }
    let region = WeightRegion {
        chunk: proto.chunk as usize,
        offset: usize::try_from(proto.offset).map_err(|_| invalid(name, "offset does not fit in usize"))?,
        length: length
            .checked_mul(data_type.size_in_bytes())
            .ok_or_else(|| invalid(name, "byte length overflows"))?,
    };
    if region.offset.checked_add(region.length).is_none() {
        return Err(invalid(name, "weight range overflows"));
    }
    model.weight_bytes(region)?;
    Ok(Constant {
        name: proto.name.clone(),
        data_type,
        shape: TensorShape::new(&dims)?,
        region,
    })
}

/// Builds the header message of a model.
pub(crate) fn encode_model(model: &Model) -> ModelProto {
    ModelProto {
        version: FORMAT_VERSION,
        inputs: model.inputs.iter().map(encode_input).collect(),
        outputs: model.outputs.clone(),
        layers: model.layers.iter().map(encode_layer).collect(),
        constants: model.constants.iter().map(encode_constant).collect(),
        metadata: model.metadata.clone(),
        warnings: model
            .warnings
            .iter()
            .map(|w| WarningProto {
                layer: w.layer.clone(),
                message: w.message.clone(),
                severity: encode_severity(w.severity),
            })
            .collect(),
        symbolic_dim_names: model
            .symbolic_dim_names
            .iter()
            .map(|(c, name)| (c.to_string(), name.clone()))
            .collect(),
        cpu_fallback: model.cpu_fallback.iter().cloned().collect(),
    }
}

/// Rebuilds a model from its header and weight chunks.
///
/// Only the encoding is checked here; graph links are left to the
/// validation passes.
pub(crate) fn decode_model(proto: ModelProto, weights: Vec<Vec<u8>>) -> Result<Model, FormatError> {
    if proto.version != FORMAT_VERSION {
        return Err(FormatError::VersionMismatch {
            found: proto.version,
            expected: FORMAT_VERSION,
        });
    }
    let mut model = Model::new();
    model.weights = weights;
    for input in &proto.inputs {
        let input = decode_input(input)?;
        model.add_input(input.name, input.data_type, input.shape)?;
    }
    for constant in &proto.constants {
        let constant = decode_constant(constant, &model)?;
        if model.is_defined(&constant.name) {
            return Err(lumen_ir::IrError::DuplicateName(constant.name).into());
        }
        model.constants.push(constant);
    }
    for layer in &proto.layers {
        model.layers.push(decode_layer(layer)?);
    }
    for output in proto.outputs {
        model.add_output(output);
    }
    model.metadata = proto.metadata;
    model.warnings = proto
        .warnings
        .into_iter()
        .map(|w| ModelWarning {
            layer: w.layer,
            message: w.message,
            severity: decode_severity(w.severity),
        })
        .collect();
    for (key, name) in proto.symbolic_dim_names {
        let c = single_char("symbolic_dim_names", &key)?;
        model.symbolic_dim_names.insert(c, name);
    }
    model.cpu_fallback = proto.cpu_fallback.into_iter().collect();
    Ok(model)
}
