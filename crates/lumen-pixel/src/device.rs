//! The device interface the pixel backend drives.
//!
//! A [`Device`] owns RGBA float textures and dispatches named kernels over
//! them. Kernels are configured by string keywords and bound to textures
//! (with the layout the kernel should read them in), float scalars and
//! integer uniforms.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use crate::error::LayoutError;
use crate::layout::TextureTensorData;

/// Handle to a texture owned by a device.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct TextureId(pub u32);

impl fmt::Display for TextureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Domain a kernel is dispatched over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchDomain {
    /// `n` invocations.
    Linear(usize),
    /// One invocation per texel of a `width x height` target.
    Grid { width: usize, height: usize },
}

impl DispatchDomain {
    /// Total number of invocations.
    pub fn len(&self) -> usize {
        match *self {
            Self::Linear(n) => n,
            Self::Grid { width, height } => width * height,
        }
    }

    /// `true` if the domain has no invocations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A value bound to a kernel parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Binding {
    /// A tensor resident in a texture, read or written in `layout`.
    Texture {
        texture: TextureId,
        layout: TextureTensorData,
    },
    /// A float uniform.
    Scalar(f32),
    /// An integer uniform.
    Int(i32),
    /// An integer vector uniform.
    IntVec(Vec<i32>),
}

/// One kernel dispatch: which kernel, how it is configured, what it binds
/// and over which domain it runs.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelInvocation {
    pub kernel: String,
    pub keywords: BTreeMap<String, String>,
    pub bindings: BTreeMap<String, Binding>,
    pub domain: DispatchDomain,
}

impl KernelInvocation {
    pub fn new(kernel: impl Into<String>, domain: DispatchDomain) -> Self {
        Self {
            kernel: kernel.into(),
            keywords: BTreeMap::new(),
            bindings: BTreeMap::new(),
            domain,
        }
    }

    /// Sets a configuration keyword.
    pub fn keyword(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.keywords.insert(key.into(), value.to_string());
        self
    }

    /// Binds a parameter.
    pub fn bind(mut self, name: impl Into<String>, binding: Binding) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    /// Binds a texture in the given layout.
    pub fn bind_texture(self, name: impl Into<String>, texture: TextureId, layout: TextureTensorData) -> Self {
        self.bind(name, Binding::Texture { texture, layout })
    }

    /// Looks up a texture binding.
    pub fn texture(&self, name: &str) -> Result<(TextureId, &TextureTensorData), LayoutError> {
        match self.bindings.get(name) {
            Some(Binding::Texture { texture, layout }) => Ok((*texture, layout)),
            _ => Err(LayoutError::MissingBinding {
                kernel: self.kernel.clone(),
                binding: name.to_string(),
            }),
        }
    }
}

/// A device that owns textures and runs kernels.
pub trait Device: Debug {
    /// Human-readable name (e.g. "software").
    fn name(&self) -> &str;

    /// Largest texture side, in texels.
    fn max_texture_size(&self) -> usize;

    /// Allocates a zero-filled `width x height` RGBA texture.
    fn create_texture(&mut self, width: usize, height: usize) -> Result<TextureId, LayoutError>;

    /// Frees a texture. Unknown handles are ignored.
    fn release_texture(&mut self, texture: TextureId);

    /// Replaces the texture contents; `texels` holds four floats per texel.
    fn write_texture(&mut self, texture: TextureId, texels: &[f32]) -> Result<(), LayoutError>;

    /// Reads the texture contents back, four floats per texel.
    fn read_texture(&self, texture: TextureId) -> Result<Vec<f32>, LayoutError>;

    /// Runs a kernel.
    fn dispatch(&mut self, invocation: &KernelInvocation) -> Result<(), LayoutError>;
}
