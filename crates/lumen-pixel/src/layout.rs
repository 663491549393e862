//! Blocked tensor-to-texture layout.
//!
//! A tensor is stored in an RGBA float texture by splitting one axis, the
//! block axis, into groups of four: each texel holds four consecutive
//! elements along that axis in its channels. With no block axis the whole
//! tensor is treated as a flat vector blocked by four.
//!
//! For a block axis `a` of a shape `S`:
//!
//! ```text
//! dim_axis      = S[a]
//! dim_axis_div4 = ceil(dim_axis / 4)
//! stride_axis   = S[a + 1] * ... * S[rank - 1]
//! blocked_shape = S with S[a] replaced by dim_axis_div4
//! ```
//!
//! The texture holds `blocked_shape.length` texels laid out row-major with
//! a power-of-two width.

use std::fmt;

use lumen_ir::TensorShape;

use crate::error::LayoutError;

/// Position of one element inside a texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Texel {
    /// Column.
    pub x: usize,
    /// Row.
    pub y: usize,
    /// RGBA channel, `0..4`.
    pub channel: usize,
}

/// Layout of a tensor in a blocked texture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureTensorData {
    shape: TensorShape,
    block_axis: Option<usize>,
    dim_axis: usize,
    dim_axis_div4: usize,
    stride_axis: usize,
    blocked_shape: TensorShape,
    width: usize,
    height: usize,
}

impl TextureTensorData {
    /// Computes the layout of `shape` blocked along `block_axis`, or flat
    /// when `block_axis` is `None`.
    pub fn new(
        shape: TensorShape,
        block_axis: Option<usize>,
        max_texture_size: usize,
    ) -> Result<Self, LayoutError> {
        let (dim_axis, stride_axis, blocked_shape) = match block_axis {
            Some(axis) => {
                if axis >= shape.rank() {
                    return Err(LayoutError::AxisOutOfRange {
                        axis,
                        rank: shape.rank(),
                    });
                }
                let dim = shape.dims()[axis];
                (dim, shape.strides(axis), shape.with_axis(axis, dim.div_ceil(4)))
            }
            None => {
                let length = shape.length();
                (length, 1, TensorShape::new(&[length.div_ceil(4)])?)
            }
        };
        let (width, height) = texture_size(blocked_shape.length(), max_texture_size)?;
        Ok(Self {
            shape,
            block_axis,
            dim_axis,
            dim_axis_div4: dim_axis.div_ceil(4),
            stride_axis,
            blocked_shape,
            width,
            height,
        })
    }

    /// The flat layout of `shape`.
    pub fn flat(shape: TensorShape, max_texture_size: usize) -> Result<Self, LayoutError> {
        Self::new(shape, None, max_texture_size)
    }

    /// Unblocked tensor shape.
    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    /// Axis split into groups of four, `None` for a flat layout.
    pub fn block_axis(&self) -> Option<usize> {
        self.block_axis
    }

    pub fn is_flat(&self) -> bool {
        self.block_axis.is_none()
    }

    pub fn dim_axis(&self) -> usize {
        self.dim_axis
    }

    pub fn dim_axis_div4(&self) -> usize {
        self.dim_axis_div4
    }

    pub fn stride_axis(&self) -> usize {
        self.stride_axis
    }

    pub fn blocked_shape(&self) -> &TensorShape {
        &self.blocked_shape
    }

    /// Number of texels the tensor occupies.
    pub fn num_pixels(&self) -> usize {
        self.blocked_shape.length()
    }

    /// Texture width in texels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Texture height in texels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Linear texel index and channel of the element at row-major
    /// position `element` of the unblocked tensor.
    pub fn block_index(&self, element: usize) -> (usize, usize) {
        let along = (element / self.stride_axis) % self.dim_axis.max(1);
        let outer = element / (self.stride_axis * self.dim_axis.max(1));
        let inner = element % self.stride_axis;
        let tex_idx = (outer * self.dim_axis_div4 + along / 4) * self.stride_axis + inner;
        (tex_idx, along % 4)
    }

    /// Texel holding the element at row-major position `element`.
    pub fn texel(&self, element: usize) -> Texel {
        let (tex_idx, channel) = self.block_index(element);
        Texel {
            x: tex_idx % self.width,
            y: tex_idx / self.width,
            channel,
        }
    }

    /// `true` if `other` places every element of the same tensor at the
    /// same texel and channel, so the texture can be reused as is.
    pub fn is_layout_identical(&self, other: &Self) -> bool {
        if self.shape != other.shape {
            return false;
        }
        self.stride_axis == other.stride_axis
            && (self.dim_axis == other.dim_axis
                || (self.dim_axis % 4 == 0 && other.dim_axis % 4 == 0))
    }
}

impl fmt::Display for TextureTensorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block_axis {
            Some(axis) => write!(f, "{} blocked on axis {axis}", self.shape)?,
            None => write!(f, "{} flat", self.shape)?,
        }
        write!(f, " ({}x{})", self.width, self.height)
    }
}

/// Width and height of a texture holding `num_pixels` texels.
///
/// The width is the smallest power of two whose square covers the next
/// power of two of `num_pixels`, capped by `num_pixels` and by the limit.
pub fn texture_size(num_pixels: usize, max_texture_size: usize) -> Result<(usize, usize), LayoutError> {
    let num_pixels = num_pixels.max(1);
    let width_shift = num_pixels.next_power_of_two().trailing_zeros().div_ceil(2);
    let width = num_pixels.min(1 << width_shift).min(max_texture_size.max(1));
    let height = num_pixels.div_ceil(width);
    if height > max_texture_size {
        return Err(LayoutError::TextureTooLarge {
            width,
            height,
            max: max_texture_size,
        });
    }
    Ok((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 16384;

    fn shape(dims: &[usize]) -> TensorShape {
        TensorShape::new(dims).unwrap()
    }

    #[test]
    fn texture_sizes() {
        assert_eq!(texture_size(1, MAX).unwrap(), (1, 1));
        assert_eq!(texture_size(5, MAX).unwrap(), (4, 2));
        assert_eq!(texture_size(12, MAX).unwrap(), (4, 3));
        assert_eq!(texture_size(16, MAX).unwrap(), (4, 4));
        assert_eq!(texture_size(17, MAX).unwrap(), (8, 3));
        assert_eq!(
            texture_size(1000, 16).unwrap_err().to_string(),
            "texture of 16x63 exceeds the maximum size of 16"
        );
    }

    #[test]
    fn nchw_blocked_on_channels() {
        let layout = TextureTensorData::new(shape(&[2, 6, 3, 3]), Some(1), MAX).unwrap();
        assert_eq!(layout.dim_axis(), 6);
        assert_eq!(layout.dim_axis_div4(), 2);
        assert_eq!(layout.stride_axis(), 9);
        assert_eq!(layout.blocked_shape().dims(), [2, 2, 3, 3]);
        assert_eq!(layout.num_pixels(), 36);
        assert!(layout.width() * layout.height() >= layout.num_pixels());

        // (n=1, c=5, h=2, w=0): channel group 1, channel 1.
        let element = 9 * 6 + 5 * 9 + 2 * 3;
        assert_eq!(layout.block_index(element), (18 + 9 + 6, 1));
    }

    #[test]
    fn flat_layout_packs_four_per_texel() {
        let layout = TextureTensorData::flat(shape(&[3, 5]), MAX).unwrap();
        assert!(layout.is_flat());
        assert_eq!(layout.num_pixels(), 4);
        assert_eq!(layout.texel(13), Texel { x: 1, y: 1, channel: 1 });
    }

    #[test]
    fn every_element_gets_its_own_slot() {
        let layout = TextureTensorData::new(shape(&[3, 7, 2]), Some(1), MAX).unwrap();
        let mut slots: Vec<(usize, usize)> = (0..42).map(|e| layout.block_index(e)).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 42);
        assert!(slots.iter().all(|&(t, _)| t < layout.num_pixels()));
    }

    #[test]
    fn identical_layouts() {
        let s = shape(&[2, 8, 4]);
        let axis = |a| TextureTensorData::new(s, a, MAX).unwrap();
        assert!(axis(Some(2)).is_layout_identical(&axis(None)));
        assert!(!axis(Some(1)).is_layout_identical(&axis(Some(2))));
        assert!(axis(Some(1)).is_layout_identical(&axis(Some(1))));

        let odd = shape(&[2, 3]);
        let flat = TextureTensorData::flat(odd, MAX).unwrap();
        let last = TextureTensorData::new(odd, Some(1), MAX).unwrap();
        assert!(!flat.is_layout_identical(&last));
    }

    #[test]
    fn bad_axis_is_rejected() {
        assert!(matches!(
            TextureTensorData::new(shape(&[2, 3]), Some(2), MAX),
            Err(LayoutError::AxisOutOfRange { axis: 2, rank: 2 })
        ));
    }
}
