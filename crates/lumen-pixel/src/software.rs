//! Host-memory implementation of [`Device`].
//!
//! Textures are plain `Vec<f32>` buffers and kernels are Rust functions
//! registered by name. Used for tests and as the reference for GPU
//! devices.

use std::collections::HashMap;

use crate::device::{Device, KernelInvocation, TextureId};
use crate::error::LayoutError;
use crate::layout::TextureTensorData;

/// Name of the re-layout kernel every device must provide.
pub const SWITCH_BLOCKED_LAYOUT: &str = "SwitchBlockedLayout";

#[derive(Clone, Debug)]
struct HostTexture {
    width: usize,
    height: usize,
    texels: Vec<f32>,
}

/// The textures of a [`SoftwareDevice`], as seen by kernels.
#[derive(Debug, Default)]
pub struct TextureStore {
    textures: HashMap<TextureId, HostTexture>,
    next_id: u32,
}

impl TextureStore {
    fn get(&self, id: TextureId) -> Result<&HostTexture, LayoutError> {
        self.textures.get(&id).ok_or(LayoutError::UnknownTexture(id))
    }

    /// Texels of a texture, four floats each.
    pub fn texels(&self, id: TextureId) -> Result<&[f32], LayoutError> {
        Ok(&self.get(id)?.texels)
    }

    /// Mutable texels of a texture.
    pub fn texels_mut(&mut self, id: TextureId) -> Result<&mut [f32], LayoutError> {
        self.textures
            .get_mut(&id)
            .map(|t| t.texels.as_mut_slice())
            .ok_or(LayoutError::UnknownTexture(id))
    }

    /// Fails unless the texture has exactly the size `layout` needs.
    pub fn check_layout(&self, id: TextureId, layout: &TextureTensorData) -> Result<(), LayoutError> {
        let texture = self.get(id)?;
        if (texture.width, texture.height) != (layout.width(), layout.height()) {
            return Err(LayoutError::ShapeMismatch {
                expected: format!("{}x{} texture", layout.width(), layout.height()),
                found: format!("{}x{} texture {id}", texture.width, texture.height),
            });
        }
        Ok(())
    }
}

/// A kernel the software device can run.
pub trait Kernel: Send + Sync {
    /// Name used in [`KernelInvocation::kernel`].
    fn name(&self) -> &'static str;

    /// Executes one dispatch.
    fn run(&self, textures: &mut TextureStore, invocation: &KernelInvocation) -> Result<(), LayoutError>;
}

/// Copies a tensor between two textures with different blocked layouts.
///
/// Bindings: `input` and `output` textures holding the same tensor shape.
/// Keyword `pad` (default `0`) fills the channels past the end of the
/// block axis.
#[derive(Debug)]
pub struct SwitchBlockedLayout;

impl Kernel for SwitchBlockedLayout {
    fn name(&self) -> &'static str {
        SWITCH_BLOCKED_LAYOUT
    }

    fn run(&self, textures: &mut TextureStore, invocation: &KernelInvocation) -> Result<(), LayoutError> {
        let (src_id, src) = invocation.texture("input")?;
        let (dst_id, dst) = invocation.texture("output")?;
        if src.shape() != dst.shape() {
            return Err(LayoutError::ShapeMismatch {
                expected: src.shape().to_string(),
                found: dst.shape().to_string(),
            });
        }
        textures.check_layout(src_id, src)?;
        textures.check_layout(dst_id, dst)?;
        let pad = match invocation.keywords.get("pad") {
            Some(v) => v.parse::<f32>().map_err(|_| LayoutError::ShapeMismatch {
                expected: "float pad value".into(),
                found: v.clone(),
            })?,
            None => 0.0,
        };

        let input = textures.texels(src_id)?.to_vec();
        let output = textures.texels_mut(dst_id)?;
        output.fill(pad);
        for element in 0..src.shape().length() {
            let (src_tex, src_ch) = src.block_index(element);
            let (dst_tex, dst_ch) = dst.block_index(element);
            output[dst_tex * 4 + dst_ch] = input[src_tex * 4 + src_ch];
        }
        Ok(())
    }
}

/// A [`Device`] backed by host memory.
pub struct SoftwareDevice {
    textures: TextureStore,
    kernels: Vec<Box<dyn Kernel>>,
    max_texture_size: usize,
}

impl std::fmt::Debug for SoftwareDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareDevice")
            .field("textures", &self.textures.textures.len())
            .field("kernels", &self.kernels.iter().map(|k| k.name()).collect::<Vec<_>>())
            .field("max_texture_size", &self.max_texture_size)
            .finish()
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(16384)
    }
}

impl SoftwareDevice {
    /// Creates a device with the built-in kernels registered.
    pub fn new(max_texture_size: usize) -> Self {
        Self {
            textures: TextureStore::default(),
            kernels: vec![Box::new(SwitchBlockedLayout)],
            max_texture_size,
        }
    }

    /// Registers an additional kernel. A kernel with the same name
    /// replaces the earlier one.
    pub fn register_kernel(&mut self, kernel: Box<dyn Kernel>) {
        self.kernels.retain(|k| k.name() != kernel.name());
        self.kernels.push(kernel);
    }

    /// Number of live textures.
    pub fn texture_count(&self) -> usize {
        self.textures.textures.len()
    }
}

impl Device for SoftwareDevice {
    fn name(&self) -> &str {
        "software"
    }

    fn max_texture_size(&self) -> usize {
        self.max_texture_size
    }

    fn create_texture(&mut self, width: usize, height: usize) -> Result<TextureId, LayoutError> {
        if width > self.max_texture_size || height > self.max_texture_size {
            return Err(LayoutError::TextureTooLarge {
                width,
                height,
                max: self.max_texture_size,
            });
        }
        let id = TextureId(self.textures.next_id);
        self.textures.next_id += 1;
        self.textures.textures.insert(
            id,
            HostTexture {
                width,
                height,
                texels: vec![0.0; width * height * 4],
            },
        );
        log::trace!("created texture {id} ({width}x{height})");
        Ok(id)
    }

    fn release_texture(&mut self, texture: TextureId) {
        if self.textures.textures.remove(&texture).is_some() {
            log::trace!("released texture {texture}");
        }
    }

    fn write_texture(&mut self, texture: TextureId, texels: &[f32]) -> Result<(), LayoutError> {
        let target = self.textures.texels_mut(texture)?;
        if target.len() != texels.len() {
            return Err(LayoutError::ShapeMismatch {
                expected: format!("{} texel values", target.len()),
                found: texels.len().to_string(),
            });
        }
        target.copy_from_slice(texels);
        Ok(())
    }

    fn read_texture(&self, texture: TextureId) -> Result<Vec<f32>, LayoutError> {
        Ok(self.textures.texels(texture)?.to_vec())
    }

    fn dispatch(&mut self, invocation: &KernelInvocation) -> Result<(), LayoutError> {
        let kernel = self
            .kernels
            .iter()
            .find(|k| k.name() == invocation.kernel)
            .ok_or_else(|| LayoutError::UnknownKernel(invocation.kernel.clone()))?;
        log::debug!(
            "dispatch {} over {} invocations",
            invocation.kernel,
            invocation.domain.len()
        );
        kernel.run(&mut self.textures, invocation)
    }
}
