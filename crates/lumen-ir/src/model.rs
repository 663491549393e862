//! The model graph: inputs, constants, layers and outputs.
//!
//! Layers are stored in execution order and reference values by name. A name
//! is defined by a model input, a constant, or an output of an earlier
//! layer. Constant data lives in a chunked weight arena; each constant
//! addresses a byte region of one chunk, and several constants may alias the
//! same region.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::error::IrError;
use crate::layer::Layer;
use crate::shape::TensorShape;
use crate::symbolic::SymbolicTensorShape;
use crate::tensor::{DataType, Tensor};

/// Largest byte size of a single weight chunk.
pub const MAX_CHUNK_BYTES: usize = i32::MAX as usize;

/// A declared model input.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInput {
    pub name: String,
    pub data_type: DataType,
    pub shape: SymbolicTensorShape,
}

/// A byte range inside one weight chunk.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct WeightRegion {
    pub chunk: usize,
    pub offset: usize,
    pub length: usize,
}

impl WeightRegion {
    fn overlaps(&self, other: &Self) -> bool {
        self.chunk == other.chunk
            && self.offset < other.offset + other.length
            && other.offset < self.offset + self.length
    }
}

/// A named constant tensor backed by the weight arena.
#[derive(Clone, Debug, PartialEq)]
pub struct Constant {
    pub name: String,
    pub data_type: DataType,
    pub shape: TensorShape,
    pub region: WeightRegion,
}

/// Severity of a model warning.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Severity {
    #[default]
    None,
    Info,
    Warning,
    Error,
}

/// A diagnostic attached to the model by the importer or a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelWarning {
    pub layer: String,
    pub message: String,
    pub severity: Severity,
}

/// A complete model graph.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub inputs: Vec<ModelInput>,
    /// Names that must stay live.
    pub outputs: Vec<String>,
    /// Layers in execution order.
    pub layers: Vec<Layer>,
    pub constants: Vec<Constant>,
    /// Weight arena chunks.
    pub weights: Vec<Vec<u8>>,
    pub metadata: BTreeMap<String, String>,
    pub warnings: Vec<ModelWarning>,
    /// Full names of single-character symbolic dimensions.
    pub symbolic_dim_names: BTreeMap<char, String>,
    /// Layers that must run on the host.
    pub cpu_fallback: BTreeSet<String>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a model input.
    pub fn add_input(
        &mut self,
        name: impl Into<String>,
        data_type: DataType,
        shape: SymbolicTensorShape,
    ) -> Result<(), IrError> {
        let name = name.into();
        if self.is_defined(&name) {
            return Err(IrError::DuplicateName(name));
        }
        self.inputs.push(ModelInput {
            name,
            data_type,
            shape,
        });
        Ok(())
    }

    /// Adds a constant whose data is copied into the weight arena.
    pub fn add_constant(&mut self, name: impl Into<String>, tensor: &Tensor) -> Result<(), IrError> {
        let name = name.into();
        if self.is_defined(&name) {
            return Err(IrError::DuplicateName(name));
        }
        let region = self.push_weights(&tensor.to_bytes());
        self.constants.push(Constant {
            name,
            data_type: tensor.data_type(),
            shape: *tensor.shape(),
            region,
        });
        Ok(())
    }

    /// Adds a constant sharing the weight region of `source`.
    pub fn alias_constant(&mut self, name: impl Into<String>, source: &str) -> Result<(), IrError> {
        let name = name.into();
        if self.is_defined(&name) {
            return Err(IrError::DuplicateName(name));
        }
        let mut constant = self
            .constant(source)
            .cloned()
            .ok_or_else(|| IrError::UnknownConstant(source.to_string()))?;
        constant.name = name;
        self.constants.push(constant);
        Ok(())
    }

    /// Appends bytes to the arena, opening a new chunk when the current one
    /// would exceed [`MAX_CHUNK_BYTES`].
    pub fn push_weights(&mut self, bytes: &[u8]) -> WeightRegion {
        let needs_chunk = self
            .weights
            .last()
            .is_none_or(|c| c.len() + bytes.len() > MAX_CHUNK_BYTES);
        if needs_chunk {
            self.weights.push(Vec::new());
        }
        let chunk = self.weights.len() - 1;
        let data = &mut self.weights[chunk];
        let offset = data.len();
        data.extend_from_slice(bytes);
        WeightRegion {
            chunk,
            offset,
            length: bytes.len(),
        }
    }

    /// Raw bytes of a weight region.
    pub fn weight_bytes(&self, region: WeightRegion) -> Result<&[u8], IrError> {
        let chunk = self.weights.get(region.chunk).ok_or(IrError::WeightOutOfBounds {
            chunk: region.chunk,
            offset: region.offset,
            end: region.offset + region.length,
            size: 0,
        })?;
        chunk
            .get(region.offset..region.offset + region.length)
            .ok_or(IrError::WeightOutOfBounds {
                chunk: region.chunk,
                offset: region.offset,
                end: region.offset + region.length,
                size: chunk.len(),
            })
    }

    /// Mutable raw bytes of a weight region. Every constant aliasing the
    /// region observes writes.
    pub fn weight_bytes_mut(&mut self, region: WeightRegion) -> Result<&mut [u8], IrError> {
        let size = self.weights.get(region.chunk).map_or(0, Vec::len);
        self.weights
            .get_mut(region.chunk)
            .and_then(|c| c.get_mut(region.offset..region.offset + region.length))
            .ok_or(IrError::WeightOutOfBounds {
                chunk: region.chunk,
                offset: region.offset,
                end: region.offset + region.length,
                size,
            })
    }

    pub fn constant(&self, name: &str) -> Option<&Constant> {
        self.constants.iter().find(|c| c.name == name)
    }

    pub fn is_constant(&self, name: &str) -> bool {
        self.constant(name).is_some()
    }

    /// Decodes a constant into a host tensor.
    pub fn constant_tensor(&self, name: &str) -> Result<Tensor, IrError> {
        let constant = self
            .constant(name)
            .ok_or_else(|| IrError::UnknownConstant(name.to_string()))?;
        let bytes = self.weight_bytes(constant.region)?;
        Tensor::from_bytes(constant.data_type, constant.shape, bytes)
    }

    /// Overwrites a constant's data in place. The new data must have the
    /// same byte size; aliases of the region see the change.
    pub fn write_constant(&mut self, name: &str, tensor: &Tensor) -> Result<(), IrError> {
        let constant = self
            .constants
            .iter_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| IrError::UnknownConstant(name.to_string()))?;
        let bytes = tensor.to_bytes();
        if bytes.len() != constant.region.length {
            return Err(IrError::DataLength {
                len: tensor.shape().length(),
                shape: constant.shape.to_string(),
            });
        }
        constant.shape = *tensor.shape();
        constant.data_type = tensor.data_type();
        let region = constant.region;
        self.weight_bytes_mut(region)?.copy_from_slice(&bytes);
        Ok(())
    }

    /// Copies a constant's data into a fresh region under a new name.
    pub fn duplicate_constant(&mut self, name: &str, new_name: impl Into<String>) -> Result<(), IrError> {
        let tensor = self.constant_tensor(name)?;
        self.add_constant(new_name, &tensor)
    }

    /// `true` if another constant's region overlaps this constant's bytes.
    pub fn is_region_shared(&self, name: &str) -> bool {
        let Some(constant) = self.constant(name) else {
            return false;
        };
        self.constants
            .iter()
            .any(|c| c.name != name && c.region.overlaps(&constant.region))
    }

    /// Removes constants for which `keep` returns `false`. Their bytes stay
    /// in the arena until [`compact_weights`](Self::compact_weights).
    pub fn retain_constants(&mut self, mut keep: impl FnMut(&Constant) -> bool) {
        self.constants.retain(|c| keep(c));
    }

    /// Rebuilds the arena so it only holds bytes of live constants.
    /// Constants that alias exactly the same region keep sharing it.
    pub fn compact_weights(&mut self) -> Result<(), IrError> {
        let old = std::mem::take(&mut self.weights);
        let mut moved: HashMap<WeightRegion, WeightRegion> = HashMap::new();
        let mut constants = std::mem::take(&mut self.constants);
        for constant in &mut constants {
            if let Some(region) = moved.get(&constant.region) {
                constant.region = *region;
                continue;
            }
            let r = constant.region;
            let bytes = old
                .get(r.chunk)
                .and_then(|c| c.get(r.offset..r.offset + r.length))
                .ok_or(IrError::WeightOutOfBounds {
                    chunk: r.chunk,
                    offset: r.offset,
                    end: r.offset + r.length,
                    size: old.get(r.chunk).map_or(0, Vec::len),
                })?;
            let region = self.push_weights(bytes);
            moved.insert(r, region);
            constant.region = region;
        }
        self.constants = constants;
        Ok(())
    }

    /// Drops all weight data. Constants remain declared but can no longer
    /// be read.
    pub fn release_weights(&mut self) {
        self.weights.clear();
        self.weights.shrink_to_fit();
    }

    pub fn input(&self, name: &str) -> Option<&ModelInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_index(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    /// Index of the layer defining `name` as any of its outputs.
    pub fn producer_index(&self, name: &str) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| l.output_names().any(|o| o == name))
    }

    pub fn is_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    /// `true` if `name` is a model input, constant or layer output.
    pub fn is_defined(&self, name: &str) -> bool {
        self.input(name).is_some() || self.is_constant(name) || self.producer_index(name).is_some()
    }

    /// Appends a layer, checking that its inputs are already defined and
    /// its outputs are not.
    pub fn add_layer(&mut self, layer: Layer) -> Result<(), IrError> {
        for (_, input) in layer.present_inputs() {
            if !self.is_defined(input) {
                return Err(IrError::UndefinedName {
                    layer: layer.name.clone(),
                    name: input.to_string(),
                });
            }
        }
        if let Some(dup) = layer.output_names().find(|o| self.is_defined(o)) {
            return Err(IrError::DuplicateName(dup.to_string()));
        }
        self.layers.push(layer);
        Ok(())
    }

    /// Declares a model output.
    pub fn add_output(&mut self, name: impl Into<String>) {
        self.outputs.push(name.into());
    }

    /// Every name currently defined by inputs, constants and layers.
    pub fn defined_names(&self) -> HashSet<&str> {
        self.inputs
            .iter()
            .map(|i| i.name.as_str())
            .chain(self.constants.iter().map(|c| c.name.as_str()))
            .chain(self.layers.iter().flat_map(Layer::output_names))
            .collect()
    }

    /// Returns `base` if unused, otherwise `base_1`, `base_2`, ...
    pub fn unique_name(&self, base: &str) -> String {
        let defined = self.defined_names();
        if !defined.contains(base) {
            return base.to_string();
        }
        (1..)
            .map(|i| format!("{base}_{i}"))
            .find(|n| !defined.contains(n.as_str()))
            .unwrap_or_else(|| base.to_string())
    }

    /// Records a diagnostic.
    pub fn warn(&mut self, layer: impl Into<String>, message: impl Into<String>, severity: Severity) {
        let layer = layer.into();
        let message = message.into();
        log::warn!("{layer}: {message}");
        self.warnings.push(ModelWarning {
            layer,
            message,
            severity,
        });
    }
}
