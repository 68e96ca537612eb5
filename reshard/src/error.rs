//! Error types for reshard

use thiserror::Error;

/// Result type alias using reshard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for checkpoint conversion
#[derive(Error, Debug)]
pub enum Error {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Invalid shape: {0}")]
    InvalidShape(String),

    #[error("Dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: String, got: String },

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Weight not found: {0}")]
    WeightNotFound(String),

    #[error("Invalid weight key: {0}")]
    InvalidWeightKey(String),

    #[error("Duplicate weight key: {0}")]
    DuplicateWeightKey(String),

    #[error("Unsupported decoder type: {0}")]
    UnsupportedDecoder(String),

    #[error("Invalid model config: {0}")]
    InvalidConfig(String),

    #[error("Invalid parallel mapping: {0}")]
    InvalidMapping(String),

    #[error("Prompt table error: {0}")]
    PromptTable(String),

    #[error("SafeTensors error: {0}")]
    SafeTensors(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<safetensors::SafeTensorError> for Error {
    fn from(e: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ShapeMismatch {
            expected: vec![4, 2],
            got: vec![3, 2],
        };
        assert_eq!(
            err.to_string(),
            "Shape mismatch: expected [4, 2], got [3, 2]"
        );
        assert_eq!(
            Error::UnsupportedDecoder("bert".into()).to_string(),
            "Unsupported decoder type: bert"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(err.to_string().starts_with("IO error"));
    }
}
