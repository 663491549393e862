//! Protobuf messages of the model header, via prost derive.
//!
//! Weight bytes are not part of these messages; constants address them by
//! chunk, offset and length in the container that follows the header.

use std::collections::BTreeMap;

use prost::Message;

/// `DataType` codes.
pub mod data_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
}

/// `DimProto.kind` codes.
pub mod dim_kind {
    pub const UNKNOWN: i32 = 0;
    pub const VALUE: i32 = 1;
    pub const PARAM: i32 = 2;
}

/// The model without its weight data.
#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, repeated, tag = "2")]
    pub inputs: Vec<InputProto>,
    #[prost(string, repeated, tag = "3")]
    pub outputs: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub layers: Vec<LayerProto>,
    #[prost(message, repeated, tag = "5")]
    pub constants: Vec<ConstantProto>,
    #[prost(btree_map = "string, string", tag = "6")]
    pub metadata: BTreeMap<String, String>,
    #[prost(message, repeated, tag = "7")]
    pub warnings: Vec<WarningProto>,
    /// Single-character symbolic dimension name to its full name.
    #[prost(btree_map = "string, string", tag = "8")]
    pub symbolic_dim_names: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "9")]
    pub cpu_fallback: Vec<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct InputProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    /// `false` when the rank is unknown; `dims` is then empty.
    #[prost(bool, tag = "3")]
    pub has_rank: bool,
    #[prost(message, repeated, tag = "4")]
    pub dims: Vec<DimProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DimProto {
    #[prost(int32, tag = "1")]
    pub kind: i32,
    #[prost(uint64, tag = "2")]
    pub value: u64,
    #[prost(string, tag = "3")]
    pub param: String,
}

/// A layer: op type name, links and op attributes.
#[derive(Clone, PartialEq, Message)]
pub struct LayerProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub op_type: String,
    #[prost(string, repeated, tag = "3")]
    pub inputs: Vec<String>,
    #[prost(string, repeated, tag = "4")]
    pub outputs: Vec<String>,
    #[prost(uint32, tag = "5")]
    pub flags: u32,
    #[prost(message, repeated, tag = "6")]
    pub attributes: Vec<AttributeProto>,
}

/// A named op attribute. Exactly one value field is set.
#[derive(Clone, PartialEq, Message)]
pub struct AttributeProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,
    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,
    #[prost(string, optional, tag = "4")]
    pub s: Option<String>,
    #[prost(int64, repeated, tag = "5")]
    pub ints: Vec<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConstantProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(uint64, repeated, tag = "3")]
    pub dims: Vec<u64>,
    #[prost(uint32, tag = "4")]
    pub chunk: u32,
    #[prost(uint64, tag = "5")]
    pub offset: u64,
    #[prost(uint64, tag = "6")]
    pub element_count: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct WarningProto {
    #[prost(string, tag = "1")]
    pub layer: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(int32, tag = "3")]
    pub severity: i32,
}
