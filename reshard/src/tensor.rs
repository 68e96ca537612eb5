//! Host-side tensor buffers.
//!
//! Checkpoint conversion never computes with weights; it only slices, pads,
//! stacks and renames them. [`HostTensor`] therefore stores raw little-endian
//! bytes plus a logical shape, and every operation here works on rows of
//! bytes so it is independent of the element type.

use crate::dtype::DType;
use crate::{Error, Result};

/// Raw tensor data on the host.
///
/// The `data` field holds `numel * dtype.size_in_bytes()` bytes in row-major
/// order. Buffers are always contiguous.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    /// Logical shape (e.g., `[vocab_size, hidden_size]` for an embedding).
    pub shape: Vec<usize>,
    /// Element dtype.
    pub dtype: DType,
    /// Raw bytes in `dtype` encoding.
    pub data: Vec<u8>,
}

impl HostTensor {
    /// Wrap raw bytes, checking that their length matches the shape.
    ///
    /// # Errors
    /// Returns an error if `data.len()` does not equal `numel * elem_size`.
    pub fn new(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = shape.iter().product::<usize>() * dtype.size_in_bytes();
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "{} bytes of {dtype} do not fill shape {shape:?} ({expected} bytes)",
                data.len()
            )));
        }
        Ok(Self { shape, dtype, data })
    }

    /// A zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Self {
        let len = shape.iter().product::<usize>() * dtype.size_in_bytes();
        Self {
            shape,
            dtype,
            data: vec![0u8; len],
        }
    }

    /// Build an `F32` tensor from a slice of values.
    ///
    /// # Errors
    /// Returns an error if `values` does not fill `shape`.
    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self> {
        Self::new(shape, DType::F32, bytemuck::cast_slice(values).to_vec())
    }

    /// Build an `I32` tensor from a slice of values.
    ///
    /// # Errors
    /// Returns an error if `values` does not fill `shape`.
    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self> {
        Self::new(shape, DType::I32, bytemuck::cast_slice(values).to_vec())
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Bytes occupied by one index along axis 0.
    #[must_use]
    pub fn row_bytes(&self) -> usize {
        self.shape.iter().skip(1).product::<usize>() * self.dtype.size_in_bytes()
    }

    /// Decode the data as `f32` values.
    ///
    /// # Panics
    /// Panics if `dtype` is not `F32`.
    #[must_use]
    pub fn to_f32_vec(&self) -> Vec<f32> {
        assert_eq!(self.dtype, DType::F32, "to_f32_vec: expected F32");
        self.data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    /// Decode the data as `i32` values.
    ///
    /// # Panics
    /// Panics if `dtype` is not `I32`.
    #[must_use]
    pub fn to_i32_vec(&self) -> Vec<i32> {
        assert_eq!(self.dtype, DType::I32, "to_i32_vec: expected I32");
        self.data
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    /// Zero-pad along axis 0 up to `rows` rows.
    ///
    /// The first `shape[0]` rows are kept byte-for-byte; new rows are zero.
    ///
    /// # Errors
    /// Returns an error for scalars or if the tensor already has more than
    /// `rows` rows.
    pub fn pad_rows(&self, rows: usize) -> Result<Self> {
        let Some(&current) = self.shape.first() else {
            return Err(Error::InvalidShape("pad_rows: scalar tensor".into()));
        };
        if current > rows {
            return Err(Error::InvalidShape(format!(
                "pad_rows: cannot pad {current} rows down to {rows}"
            )));
        }
        let mut shape = self.shape.clone();
        shape[0] = rows;
        let mut data = self.data.clone();
        data.resize(rows * self.row_bytes(), 0);
        Ok(Self {
            shape,
            dtype: self.dtype,
            data,
        })
    }

    /// Convert between floating point dtypes.
    ///
    /// Casting to the tensor's own dtype is a plain copy, whatever the dtype.
    ///
    /// # Errors
    /// Returns an error if either side is an integer dtype and they differ.
    pub fn cast(&self, dtype: DType) -> Result<Self> {
        if self.dtype == dtype {
            return Ok(self.clone());
        }
        if !self.dtype.is_float() || !dtype.is_float() {
            return Err(Error::DtypeMismatch {
                expected: dtype.to_string(),
                got: self.dtype.to_string(),
            });
        }

        let values: Vec<f32> = match self.dtype {
            DType::F32 => self.to_f32_vec(),
            DType::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            DType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            _ => unreachable!("non-float dtypes rejected above"),
        };

        let data = match dtype {
            DType::F32 => bytemuck::cast_slice(values.as_slice()).to_vec(),
            DType::F16 => values
                .iter()
                .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
                .collect(),
            DType::BF16 => values
                .iter()
                .flat_map(|&v| half::bf16::from_f32(v).to_le_bytes())
                .collect(),
            _ => unreachable!("non-float dtypes rejected above"),
        };

        Ok(Self {
            shape: self.shape.clone(),
            dtype,
            data,
        })
    }
}

/// Stack equally shaped tensors along a new leading axis.
///
/// Given `n` tensors of shape `s`, produces one tensor of shape `[n, ..s]`.
///
/// # Errors
/// Returns an error if `tensors` is empty or shapes/dtypes differ.
pub fn stack(tensors: &[HostTensor]) -> Result<HostTensor> {
    let first = tensors
        .first()
        .ok_or_else(|| Error::InvalidShape("stack: no tensors".into()))?;

    let mut data = Vec::with_capacity(first.data.len() * tensors.len());
    for t in tensors {
        if t.shape != first.shape {
            return Err(Error::ShapeMismatch {
                expected: first.shape.clone(),
                got: t.shape.clone(),
            });
        }
        if t.dtype != first.dtype {
            return Err(Error::DtypeMismatch {
                expected: first.dtype.to_string(),
                got: t.dtype.to_string(),
            });
        }
        data.extend_from_slice(&t.data);
    }

    let mut shape = Vec::with_capacity(first.ndim() + 1);
    shape.push(tensors.len());
    shape.extend_from_slice(&first.shape);

    Ok(HostTensor {
        shape,
        dtype: first.dtype,
        data,
    })
}
