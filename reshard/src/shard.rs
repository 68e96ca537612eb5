//! Tensor-parallel slicing of host tensors.
//!
//! A weight that is sharded across `tp_size` ranks is cut into `tp_size`
//! equal, contiguous pieces along one axis; rank `r` keeps piece `r`. The
//! axis length must divide evenly, which is why the vocabulary is padded
//! before the embedding and `lm_head` are split.

use std::borrow::Cow;

use crate::tensor::HostTensor;
use crate::{Error, Result};

/// Describes one slice position in a tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardConfig {
    /// Slice index (`0..world_size`)
    pub rank: usize,
    /// Number of slices
    pub world_size: usize,
}

impl ShardConfig {
    /// Compute the shard range for a dimension of size `dim`.
    ///
    /// Returns `(start, shard_size)` where the shard covers
    /// `[start .. start + shard_size)`.
    ///
    /// # Errors
    /// Returns an error if `dim` is not evenly divisible by `world_size`, if
    /// `world_size` is zero or if `rank` is out of range.
    pub fn shard_range(&self, dim: usize) -> Result<(usize, usize)> {
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(Error::InvalidMapping(format!(
                "slice {} of {} is out of range",
                self.rank, self.world_size
            )));
        }
        if dim % self.world_size != 0 {
            return Err(Error::InvalidShape(format!(
                "dimension {dim} is not evenly divisible by {}",
                self.world_size
            )));
        }
        let shard_size = dim / self.world_size;
        Ok((self.rank * shard_size, shard_size))
    }
}

/// Return the `idx`-th of `tp_size` equal slices of `v` along `dim`.
///
/// With `tp_size == 1` the input is returned as-is without copying. 1-D
/// tensors are always split along their only axis, whatever `dim` says.
/// Otherwise the slice is materialized into a fresh contiguous buffer.
///
/// # Errors
/// Returns [`Error::ShapeMismatch`] when the axis length is not divisible by
/// `tp_size`, and an error if `idx` or `dim` are out of range.
pub fn split(v: &HostTensor, tp_size: usize, idx: usize, dim: usize) -> Result<Cow<'_, HostTensor>> {
    if tp_size == 1 {
        return Ok(Cow::Borrowed(v));
    }
    if v.ndim() == 0 {
        return Err(Error::InvalidShape("cannot split a scalar tensor".into()));
    }

    let dim = if v.ndim() == 1 { 0 } else { dim };
    if dim >= v.ndim() {
        return Err(Error::InvalidShape(format!(
            "split axis {dim} out of range for shape {:?}",
            v.shape
        )));
    }

    let axis_len = v.shape[dim];
    let (start, len) = ShardConfig {
        rank: idx,
        world_size: tp_size,
    }
    .shard_range(axis_len)
    .map_err(|e| match e {
        Error::InvalidShape(_) => {
            let mut expected = v.shape.clone();
            expected[dim] = axis_len.next_multiple_of(tp_size);
            Error::ShapeMismatch {
                expected,
                got: v.shape.clone(),
            }
        }
        other => other,
    })?;

    let elem = v.dtype.size_in_bytes();
    let outer: usize = v.shape[..dim].iter().product();
    let inner_bytes = v.shape[dim + 1..].iter().product::<usize>() * elem;
    let src_stride = axis_len * inner_bytes;
    let chunk = len * inner_bytes;

    let mut data = Vec::with_capacity(outer * chunk);
    for o in 0..outer {
        let begin = o * src_stride + start * inner_bytes;
        data.extend_from_slice(&v.data[begin..begin + chunk]);
    }

    let mut shape = v.shape.clone();
    shape[dim] = len;
    Ok(Cow::Owned(HostTensor {
        shape,
        dtype: v.dtype,
        data,
    }))
}
