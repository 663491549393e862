//! The on-disk container.
//!
//! ```text
//! "LMNM"            magic
//! u32               format version
//! u64 + bytes       ModelProto header
//! u32               weight chunk count
//! (u64 + bytes)*    weight chunks
//! ```
//!
//! All integers are little-endian.

use std::path::Path;

use lumen_ir::Model;
use prost::Message;

use crate::error::FormatError;
use crate::model::{decode_model, encode_model};
use crate::proto::ModelProto;
use crate::FORMAT_VERSION;

/// File magic.
pub const MAGIC: &[u8; 4] = b"LMNM";

/// Serializes a model with its weights.
pub fn write_model(model: &Model) -> Vec<u8> {
    let header = encode_model(model).encode_to_vec();
    let weight_bytes: usize = model.weights.iter().map(|c| c.len() + 8).sum();
    let mut out = Vec::with_capacity(4 + 4 + 8 + header.len() + 4 + weight_bytes);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&(model.weights.len() as u32).to_le_bytes());
    for chunk in &model.weights {
        out.extend_from_slice(&(chunk.len() as u64).to_le_bytes());
        out.extend_from_slice(chunk);
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], FormatError> {
        if self.data.len() < n {
            return Err(FormatError::Truncated(what));
        }
        let (head, rest) = self.data.split_at(n);
        self.data = rest;
        Ok(head)
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, FormatError> {
        let bytes = self.take(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, FormatError> {
        let bytes = self.take(8, what)?;
        let mut word = [0; 8];
        word.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(word))
    }

    /// A `u64` length followed by that many bytes.
    fn block(&mut self, what: &'static str) -> Result<&'a [u8], FormatError> {
        let len = usize::try_from(self.u64(what)?).map_err(|_| FormatError::Truncated(what))?;
        self.take(len, what)
    }
}

/// Parses a serialized model.
pub fn read_model(bytes: &[u8]) -> Result<Model, FormatError> {
    let mut reader = Reader { data: bytes };
    if reader.take(4, "magic").map_err(|_| FormatError::BadMagic)? != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = reader.u32("version")?;
    if version != FORMAT_VERSION {
        return Err(FormatError::VersionMismatch {
            found: version,
            expected: FORMAT_VERSION,
        });
    }
    let header = ModelProto::decode(reader.block("model header")?)?;

    let chunk_count = reader.u32("chunk count")?;
    let mut weights = Vec::new();
    for _ in 0..chunk_count {
        weights.push(reader.block("weight chunk")?.to_vec());
    }
    if !reader.data.is_empty() {
        log::warn!("ignoring {} trailing bytes after the last weight chunk", reader.data.len());
    }

    let model = decode_model(header, weights)?;
    log::debug!(
        "read model: {} layers, {} constants, {} weight chunks",
        model.layers.len(),
        model.constants.len(),
        model.weights.len()
    );
    Ok(model)
}

/// Writes a model file.
pub fn save(model: &Model, path: impl AsRef<Path>) -> Result<(), FormatError> {
    std::fs::write(path, write_model(model))?;
    Ok(())
}

/// Reads a model file.
pub fn load(path: impl AsRef<Path>) -> Result<Model, FormatError> {
    read_model(&std::fs::read(path)?)
}
