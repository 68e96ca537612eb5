//! Tokenizer backed by the `tokenizers` crate

use std::path::Path;

use crate::{Error, Result};

/// Wrapper around a HuggingFace `tokenizer.json`
pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file or a directory holding one
    ///
    /// # Errors
    /// Returns an error if no tokenizer file exists or it cannot be parsed
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join("tokenizer.json")
        } else {
            path.to_path_buf()
        };
        if !file.exists() {
            return Err(Error::Tokenizer(format!(
                "No tokenizer.json found at {}",
                path.display()
            )));
        }

        let tokenizer =
            tokenizers::Tokenizer::from_file(&file).map_err(|e| Error::Tokenizer(e.to_string()))?;

        Ok(Self { tokenizer })
    }
}

impl super::Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}
