//! Reshard: convert flat decoder checkpoints into per-rank engine checkpoints
//!
//! A source checkpoint is one flat `name → tensor` mapping. This crate
//! redistributes it over a tensor-parallel × pipeline-parallel grid, builds
//! the matching engine configs, and converts prompt-tuning tables and
//! stop/bad word lists into the engine's tensor layouts.

pub mod checkpoint;
pub mod config;
pub mod dtype;
pub mod error;
pub mod key;
pub mod mapping;
pub mod prompt;
pub mod reshard;
pub mod shard;
pub mod tensor;
pub mod tokenizer;
pub mod word_list;

pub use config::{
    pad_vocab_size, DecoderType, ModelConfig, ModelConfigBuilder, MoeNormalizationMode,
    MoeParallelismMode, SourceConfig,
};
pub use dtype::DType;
pub use error::{Error, Result};
pub use key::{BoundaryWeight, SourceKey, WeightKind};
pub use mapping::Mapping;
pub use prompt::{prompt_convert, PromptConfig, PromptWeights};
pub use reshard::{model_to_trtllm_ckpt, ExportOptions, SourceWeights, WeightMap};
pub use shard::{split, ShardConfig};
pub use tensor::HostTensor;
pub use tokenizer::{HfTokenizer, Tokenizer};
pub use word_list::{to_word_list_format, DEFAULT_REF_STR};
