//! Data types for tensor elements

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Supported element types for host tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point
    #[serde(rename = "float32")]
    F32,
    /// 16-bit floating point (IEEE 754)
    #[serde(rename = "float16")]
    F16,
    /// Brain floating point (16-bit)
    #[serde(rename = "bfloat16")]
    BF16,
    /// 64-bit signed integer
    #[serde(rename = "int64")]
    I64,
    /// 32-bit signed integer
    #[serde(rename = "int32")]
    I32,
    /// 8-bit signed integer
    #[serde(rename = "int8")]
    I8,
    /// 8-bit unsigned integer
    #[serde(rename = "uint8")]
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::I64 => 8,
            Self::F32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::I8 | Self::U8 => 1,
        }
    }

    /// Whether this is one of the floating point types
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Name used in engine configuration files (`"bfloat16"`, `"float32"`, ...)
    #[must_use]
    pub const fn engine_name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::BF16 => "bfloat16",
            Self::I64 => "int64",
            Self::I32 => "int32",
            Self::I8 => "int8",
            Self::U8 => "uint8",
        }
    }

    /// Convert from a safetensors dtype
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            safetensors::Dtype::I64 => Some(Self::I64),
            safetensors::Dtype::I32 => Some(Self::I32),
            safetensors::Dtype::I8 => Some(Self::I8),
            safetensors::Dtype::U8 => Some(Self::U8),
            _ => None,
        }
    }

    /// Convert to the safetensors dtype used when serializing
    #[must_use]
    pub const fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::I64 => safetensors::Dtype::I64,
            Self::I32 => safetensors::Dtype::I32,
            Self::I8 => safetensors::Dtype::I8,
            Self::U8 => safetensors::Dtype::U8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.engine_name())
    }
}

impl FromStr for DType {
    type Err = Error;

    /// Accepts engine names (`bfloat16`) as well as short forms (`bf16`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Self::F32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::F16),
            "bfloat16" | "bf16" => Ok(Self::BF16),
            "int64" | "i64" => Ok(Self::I64),
            "int32" | "i32" => Ok(Self::I32),
            "int8" | "i8" => Ok(Self::I8),
            "uint8" | "u8" => Ok(Self::U8),
            _ => Err(Error::UnsupportedDtype(s.to_string())),
        }
    }
}
