//! Blocked tensor-to-texture layout engine for lumen.
//!
//! Tensors live in RGBA float textures with one axis split into groups of
//! four ([`TextureTensorData`]). A [`PixelBackend`] keeps named tensors
//! resident on a [`Device`] and re-blocks them on demand with the
//! `SwitchBlockedLayout` kernel. [`SoftwareDevice`] implements the device
//! interface on host memory.

mod backend;
mod device;
mod error;
mod layout;
mod software;

pub use backend::{PixelBackend, PixelBackendConfig};
pub use device::{Binding, Device, DispatchDomain, KernelInvocation, TextureId};
pub use error::LayoutError;
pub use layout::{Texel, TextureTensorData, texture_size};
pub use software::{Kernel, SWITCH_BLOCKED_LAYOUT, SoftwareDevice, SwitchBlockedLayout, TextureStore};
