//! Fixed-capacity tensor shapes.
//!
//! A [`TensorShape`] stores up to [`MAX_RANK`] dimensions right-aligned in a
//! fixed array: unused leading slots hold `1`, so broadcasting and stride
//! computations never need to special-case the rank.

use std::fmt;
use std::ops::Index;

use crate::error::IrError;

/// Maximum number of dimensions a tensor can have.
pub const MAX_RANK: usize = 8;

/// A concrete tensor shape of rank `0..=MAX_RANK`.
#[derive(Clone, Copy, Hash, Eq, PartialEq)]
pub struct TensorShape {
    dims: [usize; MAX_RANK],
    rank: usize,
    length: usize,
}

impl TensorShape {
    /// Creates a shape from its dimensions, outermost first.
    pub fn new(dims: &[usize]) -> Result<Self, IrError> {
        if dims.len() > MAX_RANK {
            return Err(IrError::RankOverflow {
                rank: dims.len(),
                max: MAX_RANK,
            });
        }
        if dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d)).is_none() {
            return Err(IrError::LengthOverflow(format!("{dims:?}")));
        }
        let mut packed = [1; MAX_RANK];
        packed[MAX_RANK - dims.len()..].copy_from_slice(dims);
        Ok(Self::from_packed(packed, dims.len()))
    }

    /// The rank-0 shape of a scalar.
    pub fn scalar() -> Self {
        Self::from_packed([1; MAX_RANK], 0)
    }

    fn from_packed(dims: [usize; MAX_RANK], rank: usize) -> Self {
        let length = dims[MAX_RANK - rank..].iter().product();
        Self { dims, rank, length }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Total number of elements.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The dimensions, outermost first.
    pub fn dims(&self) -> &[usize] {
        &self.dims[MAX_RANK - self.rank..]
    }

    /// Resolves a possibly negative axis against this shape's rank.
    pub fn axis(&self, axis: isize) -> Result<usize, IrError> {
        normalize_axis(axis, self.rank)
    }

    /// Size of the given (possibly negative) axis.
    pub fn get(&self, axis: isize) -> Result<usize, IrError> {
        Ok(self.dims()[self.axis(axis)?])
    }

    /// Sets the size of an axis and recomputes the cached length.
    pub fn set(&mut self, axis: isize, size: usize) -> Result<(), IrError> {
        let axis = self.axis(axis)?;
        self.dims[MAX_RANK - self.rank + axis] = size;
        self.length = self.dims().iter().product();
        Ok(())
    }

    /// Element stride of `axis`: the product of all inner dimensions.
    pub fn strides(&self, axis: usize) -> usize {
        self.dims()[axis + 1..].iter().product()
    }

    /// Product of the dimensions in `start..end`.
    pub fn length_range(&self, start: usize, end: usize) -> usize {
        self.dims()[start..end].iter().product()
    }

    /// Returns the shape with `axis` replaced by `size`.
    pub fn with_axis(&self, axis: usize, size: usize) -> Self {
        let mut out = *self;
        out.dims[MAX_RANK - self.rank + axis] = size;
        out.length = out.dims().iter().product();
        out
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(&self, other: &Self) -> Result<Self, IrError> {
        let rank = self.rank.max(other.rank);
        let mut dims = [1; MAX_RANK];
        for (i, d) in dims.iter_mut().enumerate() {
            let (a, b) = (self.dims[i], other.dims[i]);
            *d = match (a, b) {
                _ if a == b => a,
                (1, _) => b,
                (_, 1) => a,
                _ => {
                    return Err(IrError::IncompatibleShapes {
                        lhs: self.to_string(),
                        rhs: other.to_string(),
                    });
                }
            };
        }
        Ok(Self::from_packed(dims, rank))
    }

    /// Applies a permutation: output axis `i` takes input axis `perm[i]`.
    pub fn transpose(&self, perm: &[usize]) -> Result<Self, IrError> {
        if perm.len() != self.rank {
            return Err(IrError::IncompatibleShapes {
                lhs: self.to_string(),
                rhs: format!("{perm:?}"),
            });
        }
        let dims = self.dims();
        let permuted: Vec<usize> = perm.iter().map(|&p| dims[p]).collect();
        Self::new(&permuted)
    }

    /// Shape after reducing over `axes`.
    pub fn reduce(&self, axes: &[usize], keep_dims: bool) -> Result<Self, IrError> {
        let dims: Vec<usize> = self
            .dims()
            .iter()
            .enumerate()
            .filter_map(|(i, &d)| match (axes.contains(&i), keep_dims) {
                (false, _) => Some(d),
                (true, true) => Some(1),
                (true, false) => None,
            })
            .collect();
        Self::new(&dims)
    }

    /// Output shape of a batched matrix multiplication.
    pub fn matmul(&self, other: &Self) -> Result<Self, IrError> {
        let incompatible = || IrError::IncompatibleShapes {
            lhs: self.to_string(),
            rhs: other.to_string(),
        };
        if self.rank == 0 || other.rank == 0 {
            return Err(incompatible());
        }
        let a = self.dims();
        let b = other.dims();
        let (m, k) = if a.len() == 1 {
            (None, a[0])
        } else {
            (Some(a[a.len() - 2]), a[a.len() - 1])
        };
        let (k2, n) = if b.len() == 1 {
            (b[0], None)
        } else {
            (b[b.len() - 2], Some(b[b.len() - 1]))
        };
        if k != k2 {
            return Err(incompatible());
        }
        let batch_a = Self::new(&a[..a.len().saturating_sub(2)])?;
        let batch_b = Self::new(&b[..b.len().saturating_sub(2)])?;
        let batch = batch_a.broadcast(&batch_b)?;
        let mut dims = batch.dims().to_vec();
        dims.extend(m);
        dims.extend(n);
        Self::new(&dims)
    }

    /// Converts a flat element index into per-axis coordinates.
    pub fn unravel(&self, mut index: usize) -> Vec<usize> {
        let mut coords = vec![0; self.rank];
        for (axis, c) in coords.iter_mut().enumerate().rev() {
            let d = self.dims()[axis];
            *c = index % d;
            index /= d;
        }
        coords
    }
}

/// Resolves a possibly negative axis against `rank`.
pub fn normalize_axis(axis: isize, rank: usize) -> Result<usize, IrError> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(IrError::AxisOutOfRange { axis, rank });
    }
    Ok(resolved as usize)
}

impl Index<usize> for TensorShape {
    type Output = usize;

    fn index(&self, axis: usize) -> &usize {
        &self.dims()[axis]
    }
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, d) in self.dims().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_aligned_storage() {
        let shape = TensorShape::new(&[2, 3, 4]).unwrap();
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.length(), 24);
        assert_eq!(shape.dims(), &[2, 3, 4]);
        assert_eq!(shape.dims, [1, 1, 1, 1, 1, 2, 3, 4]);
    }

    #[test]
    fn rank_overflow() {
        let err = TensorShape::new(&[1; 9]).unwrap_err();
        assert!(matches!(err, IrError::RankOverflow { rank: 9, .. }));
    }

    #[test]
    fn length_overflow() {
        let err = TensorShape::new(&[1 << 40, 1 << 40]).unwrap_err();
        assert!(matches!(err, IrError::LengthOverflow(_)));
        assert_eq!(TensorShape::new(&[1 << 20, 1 << 20]).unwrap().length(), 1 << 40);
    }

    #[test]
    fn negative_axes() {
        let shape = TensorShape::new(&[2, 3, 4]).unwrap();
        assert_eq!(shape.get(-1).unwrap(), 4);
        assert_eq!(shape.get(-3).unwrap(), 2);
        assert!(shape.get(-4).is_err());
        assert!(shape.get(3).is_err());
    }

    #[test]
    fn set_recomputes_length() {
        let mut shape = TensorShape::new(&[2, 3]).unwrap();
        shape.set(-1, 5).unwrap();
        assert_eq!(shape.length(), 10);
    }

    #[test]
    fn strides() {
        let shape = TensorShape::new(&[2, 3, 4, 5]).unwrap();
        assert_eq!(shape.strides(0), 60);
        assert_eq!(shape.strides(1), 20);
        assert_eq!(shape.strides(3), 1);
    }

    #[test]
    fn broadcast_shapes() {
        let a = TensorShape::new(&[4, 1, 3]).unwrap();
        let b = TensorShape::new(&[5, 1]).unwrap();
        assert_eq!(a.broadcast(&b).unwrap().dims(), &[4, 5, 3]);

        let c = TensorShape::new(&[2]).unwrap();
        assert!(a.broadcast(&c).is_err());
    }

    #[test]
    fn scalar_shape() {
        let s = TensorShape::scalar();
        assert_eq!(s.rank(), 0);
        assert_eq!(s.length(), 1);
        assert_eq!(s.to_string(), "()");
    }

    #[test]
    fn matmul_shapes() {
        let a = TensorShape::new(&[2, 3, 4]).unwrap();
        let b = TensorShape::new(&[4, 5]).unwrap();
        assert_eq!(a.matmul(&b).unwrap().dims(), &[2, 3, 5]);

        let v = TensorShape::new(&[4]).unwrap();
        assert_eq!(a.matmul(&v).unwrap().dims(), &[2, 3]);
        assert!(b.matmul(&a).is_err());
    }

    #[test]
    fn reduce_and_transpose() {
        let a = TensorShape::new(&[2, 3, 4]).unwrap();
        assert_eq!(a.reduce(&[2], true).unwrap().dims(), &[2, 3, 1]);
        assert_eq!(a.reduce(&[0, 2], false).unwrap().dims(), &[3]);
        assert_eq!(a.transpose(&[2, 0, 1]).unwrap().dims(), &[4, 2, 3]);
    }

    #[test]
    fn unravel_index() {
        let a = TensorShape::new(&[2, 3, 4]).unwrap();
        assert_eq!(a.unravel(23), vec![1, 2, 3]);
        assert_eq!(a.unravel(5), vec![0, 1, 1]);
    }
}
