//! Native binary model format for lumen.
//!
//! A model file is a small container: magic, version, a protobuf header
//! ([`proto::ModelProto`]) describing inputs, layers, constants and
//! metadata, then the raw weight chunks the constants point into.

mod container;
mod error;
mod model;
mod op;
pub mod proto;

pub use container::{MAGIC, load, read_model, save, write_model};
pub use error::FormatError;

/// Current format version. Files with any other version are rejected.
pub const FORMAT_VERSION: u32 = 1;
