//! Tokenizer integration
//!
//! Defines the [`Tokenizer`] trait used by the word-list encoder and a
//! `tokenizer.json` backed implementation.

mod hf_tokenizer;

use crate::Result;

pub use hf_tokenizer::HfTokenizer;

/// Trait for tokenizers that convert text to token IDs.
pub trait Tokenizer {
    /// Encode text to token IDs, without special tokens.
    ///
    /// # Errors
    /// Returns an error if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
}
