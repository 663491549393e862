//! Tensor residency on a pixel device.
//!
//! [`PixelBackend`] tracks which textures hold which named tensors and in
//! what layout. Before a kernel runs, its operands are pinned to the block
//! axis it expects; a tensor whose current layout already places every
//! element correctly only has its bookkeeping updated, otherwise a new
//! texture is allocated and filled by a `SwitchBlockedLayout` dispatch.

use std::collections::HashMap;

use lumen_ir::Tensor;

use crate::device::{Binding, Device, DispatchDomain, KernelInvocation, TextureId};
use crate::error::LayoutError;
use crate::layout::TextureTensorData;
use crate::software::SWITCH_BLOCKED_LAYOUT;

/// Backend configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBackendConfig {
    /// Largest texture side the backend will allocate. The effective limit
    /// is the smaller of this and the device's own.
    pub max_texture_size: usize,
}

impl Default for PixelBackendConfig {
    fn default() -> Self {
        Self {
            max_texture_size: 16384,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Resident {
    texture: TextureId,
    layout: TextureTensorData,
}

/// Named tensors resident on a [`Device`].
#[derive(Debug)]
pub struct PixelBackend<D: Device> {
    device: D,
    config: PixelBackendConfig,
    tensors: HashMap<String, Resident>,
}

impl<D: Device> PixelBackend<D> {
    pub fn new(device: D, config: PixelBackendConfig) -> Self {
        Self {
            device,
            config,
            tensors: HashMap::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Effective texture size limit.
    pub fn max_texture_size(&self) -> usize {
        self.config.max_texture_size.min(self.device.max_texture_size())
    }

    /// Current layout of a resident tensor.
    pub fn layout(&self, name: &str) -> Option<&TextureTensorData> {
        self.tensors.get(name).map(|r| &r.layout)
    }

    /// Texture currently holding a resident tensor.
    pub fn texture(&self, name: &str) -> Option<TextureId> {
        self.tensors.get(name).map(|r| r.texture)
    }

    fn resident(&self, name: &str) -> Result<Resident, LayoutError> {
        self.tensors
            .get(name)
            .copied()
            .ok_or_else(|| LayoutError::UnknownTensor(name.to_string()))
    }

    fn allocate(&mut self, layout: &TextureTensorData) -> Result<TextureId, LayoutError> {
        self.device.create_texture(layout.width(), layout.height())
    }

    /// Allocates a texture for `to` and fills it from `from` with a
    /// re-layout dispatch.
    fn relayout(
        &mut self,
        source: TextureId,
        from: TextureTensorData,
        to: TextureTensorData,
    ) -> Result<TextureId, LayoutError> {
        let target = self.allocate(&to)?;
        let invocation = KernelInvocation::new(
            SWITCH_BLOCKED_LAYOUT,
            DispatchDomain::Grid {
                width: to.width(),
                height: to.height(),
            },
        )
        .bind_texture("input", source, from)
        .bind_texture("output", target, to);
        if let Err(e) = self.device.dispatch(&invocation) {
            self.device.release_texture(target);
            return Err(e);
        }
        Ok(target)
    }

    /// Copies a host tensor to the device, blocked along `block_axis`.
    ///
    /// The data is written into a flat texture; blocked layouts are then
    /// produced by a re-layout dispatch and the flat texture is freed.
    pub fn upload(
        &mut self,
        name: &str,
        tensor: &Tensor,
        block_axis: Option<usize>,
    ) -> Result<&TextureTensorData, LayoutError> {
        if self.tensors.contains_key(name) {
            return Err(LayoutError::DuplicateTensor(name.to_string()));
        }
        let max = self.max_texture_size();
        let flat = TextureTensorData::flat(*tensor.shape(), max)?;
        let layout = TextureTensorData::new(*tensor.shape(), block_axis, max)?;

        let mut texels = tensor.as_f32()?.to_vec();
        texels.resize(flat.width() * flat.height() * 4, 0.0);
        let staging = self.allocate(&flat)?;
        if let Err(e) = self.device.write_texture(staging, &texels) {
            self.device.release_texture(staging);
            return Err(e);
        }

        let texture = if flat.is_layout_identical(&layout) {
            staging
        } else {
            let texture = self.relayout(staging, flat, layout);
            self.device.release_texture(staging);
            texture?
        };
        log::debug!("uploaded '{name}' as {layout}");
        let resident = self
            .tensors
            .entry(name.to_string())
            .or_insert(Resident { texture, layout });
        Ok(&resident.layout)
    }

    /// Reads a resident tensor back to the host.
    pub fn download(&mut self, name: &str) -> Result<Tensor, LayoutError> {
        let Resident { texture, layout } = self.resident(name)?;
        let flat = TextureTensorData::flat(*layout.shape(), self.max_texture_size())?;

        let texels = if flat.is_layout_identical(&layout) {
            self.device.read_texture(texture)?
        } else {
            let staging = self.relayout(texture, layout, flat)?;
            let texels = self.device.read_texture(staging);
            self.device.release_texture(staging);
            texels?
        };
        let length = layout.shape().length();
        let values = texels.get(..length).ok_or_else(|| LayoutError::ShapeMismatch {
            expected: format!("{length} values"),
            found: texels.len().to_string(),
        })?;
        Ok(Tensor::from_f32(layout.shape().dims(), values.to_vec())?)
    }

    /// Ensures `name` is laid out blocked along `block_axis`.
    pub fn pin(&mut self, name: &str, block_axis: Option<usize>) -> Result<&TextureTensorData, LayoutError> {
        let current = self.resident(name)?;
        let wanted = TextureTensorData::new(*current.layout.shape(), block_axis, self.max_texture_size())?;

        let texture = if current.layout.is_layout_identical(&wanted) {
            current.texture
        } else {
            log::debug!("re-blocking '{name}': {} -> {wanted}", current.layout);
            let texture = self.relayout(current.texture, current.layout, wanted)?;
            self.device.release_texture(current.texture);
            texture
        };
        let resident = self
            .tensors
            .get_mut(name)
            .ok_or_else(|| LayoutError::UnknownTensor(name.to_string()))?;
        *resident = Resident {
            texture,
            layout: wanted,
        };
        Ok(&resident.layout)
    }

    /// Pins two tensors to the same block axis, counted from the last
    /// dimension so operands of different rank line up.
    ///
    /// If exactly one of them is already blocked, the other follows it. If
    /// both are, `a` keeps its axis. If neither is, both are blocked on
    /// their innermost axis. Returns the axes chosen for `a` and `b`.
    pub fn pin_both_same(&mut self, a: &str, b: &str) -> Result<(usize, usize), LayoutError> {
        let ra = self.resident(a)?;
        let rb = self.resident(b)?;
        let (rank_a, rank_b) = (ra.layout.shape().rank(), rb.layout.shape().rank());

        // Axes as offsets from the innermost dimension.
        let from_end = |axis: usize, rank: usize| rank - 1 - axis;
        let offset = match (ra.layout.block_axis(), rb.layout.block_axis()) {
            (Some(axis), _) => from_end(axis, rank_a),
            (None, Some(axis)) => from_end(axis, rank_b),
            (None, None) => 0,
        };
        let resolve = |rank: usize| {
            rank.checked_sub(offset + 1)
                .ok_or(LayoutError::AxisOutOfRange { axis: offset, rank })
        };
        let (axis_a, axis_b) = (resolve(rank_a)?, resolve(rank_b)?);

        self.pin(a, Some(axis_a))?;
        self.pin(b, Some(axis_b))?;
        Ok((axis_a, axis_b))
    }

    /// Texture binding for a resident tensor in its current layout.
    pub fn binding(&self, name: &str) -> Result<Binding, LayoutError> {
        let Resident { texture, layout } = self.resident(name)?;
        Ok(Binding::Texture { texture, layout })
    }

    /// Runs a kernel on the device. Operands are expected to be pinned.
    pub fn dispatch(&mut self, invocation: &KernelInvocation) -> Result<(), LayoutError> {
        self.device.dispatch(invocation)
    }

    /// Frees the texture of a resident tensor.
    pub fn release(&mut self, name: &str) -> Result<(), LayoutError> {
        let resident = self
            .tensors
            .remove(name)
            .ok_or_else(|| LayoutError::UnknownTensor(name.to_string()))?;
        self.device.release_texture(resident.texture);
        log::trace!("released '{name}'");
        Ok(())
    }

    /// Frees every resident tensor.
    pub fn release_all(&mut self) {
        for (_, resident) in self.tensors.drain() {
            self.device.release_texture(resident.texture);
        }
    }
}
