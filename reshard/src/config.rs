//! Source hyperparameters and the engine checkpoint configuration.
//!
//! [`SourceConfig`] is parsed from the training framework's model config
//! (JSON). [`ModelConfigBuilder`] turns it into the rank-independent
//! [`ModelConfig`]; the resharder then clones that once per rank and attaches
//! the rank's [`Mapping`].

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::mapping::Mapping;
use crate::{Error, Result};

/// Decoder families the engine can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecoderType {
    GptJ,
    GptNext,
    Llama,
    Gemma,
    Falcon,
}

/// Decoder tag and engine architecture name, in [`DecoderType`] order.
const DECODER_ARCHITECTURES: [(&str, &str); 5] = [
    ("gptj", "GPTForCausalLM"),
    ("gptnext", "GPTForCausalLM"),
    ("llama", "LLaMAForCausalLM"),
    ("gemma", "GemmaForCausalLM"),
    ("falcon", "FalconForCausalLM"),
];

impl DecoderType {
    pub const ALL: [Self; 5] = [
        Self::GptJ,
        Self::GptNext,
        Self::Llama,
        Self::Gemma,
        Self::Falcon,
    ];

    /// Short tag used on the command line (`"llama"`).
    #[must_use]
    pub fn tag(self) -> &'static str {
        DECODER_ARCHITECTURES[self as usize].0
    }

    /// Engine architecture name (`"LLaMAForCausalLM"`).
    #[must_use]
    pub fn architecture(self) -> &'static str {
        DECODER_ARCHITECTURES[self as usize].1
    }
}

impl FromStr for DecoderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.tag() == s)
            .ok_or_else(|| Error::UnsupportedDecoder(s.to_string()))
    }
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Gated activation → the activation applied inside its gate.
const GATED_ACTIVATIONS: [(&str, &str); 3] =
    [("swiglu", "silu"), ("fast-swiglu", "silu"), ("geglu", "gelu")];

/// Non-gated equivalent of an activation; non-gated names map to themselves.
#[must_use]
pub fn non_gated_version(activation: &str) -> &str {
    GATED_ACTIVATIONS
        .iter()
        .find(|(gated, _)| *gated == activation)
        .map_or(activation, |(_, plain)| *plain)
}

/// Engine `hidden_act` for a source activation name.
///
/// `MoE` models keep the last `-`-separated segment (`fast-swiglu` →
/// `swiglu`); dense models use [`non_gated_version`].
#[must_use]
pub fn resolve_hidden_act(activation: &str, is_moe: bool) -> String {
    if is_moe {
        activation
            .rsplit('-')
            .next()
            .unwrap_or(activation)
            .to_string()
    } else {
        non_gated_version(activation).to_string()
    }
}

/// Round `vocab_size` up to the next multiple of `tp_size`.
#[must_use]
pub fn pad_vocab_size(vocab_size: usize, tp_size: usize) -> usize {
    vocab_size.div_ceil(tp_size) * tp_size
}

/// How `MoE` expert weights are renormalized after top-k selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MoeNormalizationMode {
    None,
    #[default]
    Renormalize,
}

impl TryFrom<u8> for MoeNormalizationMode {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Renormalize),
            _ => Err(format!("unknown MoE normalization mode {v}")),
        }
    }
}

impl From<MoeNormalizationMode> for u8 {
    fn from(m: MoeNormalizationMode) -> Self {
        match m {
            MoeNormalizationMode::None => 0,
            MoeNormalizationMode::Renormalize => 1,
        }
    }
}

/// How `MoE` experts are distributed across tensor-parallel ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MoeParallelismMode {
    ExpertParallel,
    #[default]
    TensorParallel,
}

impl TryFrom<u8> for MoeParallelismMode {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, String> {
        match v {
            0 => Ok(Self::ExpertParallel),
            1 => Ok(Self::TensorParallel),
            _ => Err(format!("unknown MoE parallelism mode {v}")),
        }
    }
}

impl From<MoeParallelismMode> for u8 {
    fn from(m: MoeParallelismMode) -> Self {
        match m {
            MoeParallelismMode::ExpertParallel => 0,
            MoeParallelismMode::TensorParallel => 1,
        }
    }
}

/// Hyperparameters of the source model.
///
/// Field names follow the training framework's model config.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Number of transformer layers
    pub num_layers: usize,

    /// Number of attention heads
    pub num_attention_heads: usize,

    /// Number of key-value groups (for GQA, defaults to `num_attention_heads`)
    #[serde(default)]
    pub num_query_groups: Option<usize>,

    /// Per-head size (defaults to `hidden_size / num_attention_heads`)
    #[serde(default)]
    pub kv_channels: Option<usize>,

    /// Hidden dimension size
    pub hidden_size: usize,

    /// Intermediate size for the MLP
    pub ffn_hidden_size: usize,

    #[serde(default = "default_layernorm_epsilon")]
    pub layernorm_epsilon: f64,

    #[serde(default = "default_activation")]
    pub activation: String,

    /// Whether linear layers carry biases
    #[serde(default = "default_bias")]
    pub bias: bool,

    #[serde(default)]
    pub num_moe_experts: Option<usize>,

    #[serde(default)]
    pub moe_router_topk: Option<usize>,

    #[serde(default)]
    pub moe_renorm_mode: Option<MoeNormalizationMode>,

    #[serde(default)]
    pub moe_tp_mode: Option<MoeParallelismMode>,

    /// Fraction of each head that is rotated by RoPE
    #[serde(default = "default_rotary_percentage")]
    pub rotary_percentage: f64,

    /// Rotary position embedding base frequency
    #[serde(default = "default_rotary_base")]
    pub rotary_base: f64,

    /// Linear RoPE interpolation factor, if the model was context-extended
    #[serde(default)]
    pub seq_len_interpolation_factor: Option<f64>,

    /// `"rope"` or `"learned_absolute"`
    #[serde(default = "default_position_embedding_type")]
    pub position_embedding_type: String,

    /// Maximum sequence length
    pub max_position_embeddings: usize,
}

fn default_layernorm_epsilon() -> f64 {
    1e-5
}

fn default_activation() -> String {
    "gelu".to_string()
}

fn default_bias() -> bool {
    true
}

fn default_rotary_percentage() -> f64 {
    1.0
}

fn default_rotary_base() -> f64 {
    10000.0
}

fn default_position_embedding_type() -> String {
    "learned_absolute".to_string()
}

impl SourceConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the hyperparameters that later computations divide by.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `num_attention_heads` is zero, or
    /// if `kv_channels` is absent and `hidden_size` does not split evenly
    /// over the heads.
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 {
            return Err(Error::InvalidConfig(
                "num_attention_heads must be positive".into(),
            ));
        }
        if self.kv_channels.is_none() && self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn num_kv_heads(&self) -> usize {
        self.num_query_groups.unwrap_or(self.num_attention_heads)
    }

    #[must_use]
    pub fn head_size(&self) -> usize {
        self.kv_channels.unwrap_or_else(|| {
            self.hidden_size
                .checked_div(self.num_attention_heads)
                .unwrap_or(0)
        })
    }

    #[must_use]
    pub fn is_moe(&self) -> bool {
        self.num_moe_experts.unwrap_or(0) > 0
    }
}

/// Position embedding flavour understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    LearnedAbsolute,
    RopeGptNeox,
}

impl PositionEmbeddingType {
    /// `"rope"` maps to GPT-NeoX style RoPE; everything else is learned.
    #[must_use]
    pub fn from_source(kind: &str) -> Self {
        if kind == "rope" {
            Self::RopeGptNeox
        } else {
            Self::LearnedAbsolute
        }
    }
}

/// RoPE scaling descriptor (`{"type": "linear", "factor": 4.0}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotaryScaling {
    #[serde(rename = "type")]
    pub scaling_type: String,
    pub factor: f64,
}

impl RotaryScaling {
    #[must_use]
    pub fn linear(factor: f64) -> Self {
        Self {
            scaling_type: "linear".to_string(),
            factor,
        }
    }
}

/// Quantization settings. Conversion never quantizes, so both are `None`
/// and serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizationConfig {
    pub quant_algo: Option<String>,
    pub kv_cache_quant_algo: Option<String>,
}

/// Engine checkpoint configuration, serialized as the checkpoint's
/// `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub architecture: String,
    pub dtype: DType,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub norm_epsilon: f64,
    /// Padded vocabulary size
    pub vocab_size: usize,
    pub position_embedding_type: PositionEmbeddingType,
    pub max_position_embeddings: usize,
    pub hidden_act: String,
    pub use_parallel_embedding: bool,
    pub embedding_sharding_dim: usize,
    pub share_embedding_table: bool,
    pub quantization: QuantizationConfig,
    pub bias: bool,
    pub apply_query_key_layer_scaling: bool,
    pub rotary_pct: f64,
    pub rotary_base: f64,
    pub moe_num_experts: usize,
    pub moe_top_k: Option<usize>,
    pub moe_normalization_mode: MoeNormalizationMode,
    pub moe_tp_mode: MoeParallelismMode,
    pub logits_dtype: DType,
    pub world_size: usize,
    pub tp_size: usize,
    pub pp_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotary_scaling: Option<RotaryScaling>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_decoder_architecture: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_attention: Option<bool>,
    /// Attached per rank by the resharder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<Mapping>,
}

impl ModelConfig {
    /// A copy of this config bound to one rank.
    #[must_use]
    pub fn with_mapping(&self, mapping: Mapping) -> Self {
        Self {
            mapping: Some(mapping),
            ..self.clone()
        }
    }

    /// Whether `post_layernorm` weights must be published as `mlp_layernorm`.
    #[must_use]
    pub fn uses_mlp_layernorm(&self) -> bool {
        self.new_decoder_architecture.unwrap_or(false)
    }
}

/// Builds a [`ModelConfig`] from source hyperparameters.
#[derive(Debug, Clone)]
pub struct ModelConfigBuilder<'a> {
    source: &'a SourceConfig,
    decoder: DecoderType,
    dtype: DType,
    vocab_size: usize,
    tp_size: usize,
    pp_size: usize,
    use_parallel_embedding: bool,
}

impl<'a> ModelConfigBuilder<'a> {
    #[must_use]
    pub fn new(source: &'a SourceConfig, decoder: DecoderType) -> Self {
        Self {
            source,
            decoder,
            dtype: DType::BF16,
            vocab_size: 0,
            tp_size: 1,
            pp_size: 1,
            use_parallel_embedding: false,
        }
    }

    #[must_use]
    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// Vocabulary size after padding.
    #[must_use]
    pub fn vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    #[must_use]
    pub fn parallelism(mut self, tp_size: usize, pp_size: usize) -> Self {
        self.tp_size = tp_size;
        self.pp_size = pp_size;
        self
    }

    #[must_use]
    pub fn use_parallel_embedding(mut self, enabled: bool) -> Self {
        self.use_parallel_embedding = enabled;
        self
    }

    #[must_use]
    pub fn build(self) -> ModelConfig {
        let src = self.source;

        // Falcon-7B has 32 layers and the original decoder; larger Falcons
        // use the new one.
        let (new_decoder_architecture, parallel_attention) = match self.decoder {
            DecoderType::Falcon => (Some(src.num_layers != 32), Some(true)),
            _ => (None, None),
        };

        ModelConfig {
            architecture: self.decoder.architecture().to_string(),
            dtype: self.dtype,
            num_hidden_layers: src.num_layers,
            num_attention_heads: src.num_attention_heads,
            num_key_value_heads: src.num_kv_heads(),
            head_size: src.head_size(),
            hidden_size: src.hidden_size,
            intermediate_size: src.ffn_hidden_size,
            norm_epsilon: src.layernorm_epsilon,
            vocab_size: self.vocab_size,
            position_embedding_type: PositionEmbeddingType::from_source(
                &src.position_embedding_type,
            ),
            max_position_embeddings: src.max_position_embeddings,
            hidden_act: resolve_hidden_act(&src.activation, src.is_moe()),
            use_parallel_embedding: self.use_parallel_embedding,
            embedding_sharding_dim: 0,
            share_embedding_table: false,
            quantization: QuantizationConfig::default(),
            bias: src.bias,
            apply_query_key_layer_scaling: false,
            rotary_pct: src.rotary_percentage,
            rotary_base: src.rotary_base,
            moe_num_experts: src.num_moe_experts.unwrap_or(0),
            moe_top_k: src.moe_router_topk,
            moe_normalization_mode: src.moe_renorm_mode.unwrap_or_default(),
            moe_tp_mode: src.moe_tp_mode.unwrap_or_default(),
            logits_dtype: DType::F32,
            world_size: self.tp_size * self.pp_size,
            tp_size: self.tp_size,
            pp_size: self.pp_size,
            rotary_scaling: src.seq_len_interpolation_factor.map(RotaryScaling::linear),
            new_decoder_architecture,
            parallel_attention,
            mapping: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(json: &str) -> SourceConfig {
        serde_json::from_str(json).unwrap()
    }

    const BASE: &str = r#"{
        "num_layers": 4,
        "num_attention_heads": 8,
        "hidden_size": 256,
        "ffn_hidden_size": 1024,
        "max_position_embeddings": 2048
    }"#;

    #[test]
    fn test_source_defaults() {
        let cfg = source(BASE);
        assert_eq!(cfg.num_kv_heads(), 8);
        assert_eq!(cfg.head_size(), 32);
        assert_eq!(cfg.activation, "gelu");
        assert!(cfg.bias);
        assert!(!cfg.is_moe());
        assert!((cfg.rotary_base - 10000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.seq_len_interpolation_factor, None);
    }

    fn zero_heads() -> String {
        BASE.replace("\"num_attention_heads\": 8", "\"num_attention_heads\": 0")
    }

    #[test]
    fn test_validate_rejects_zero_heads() {
        let cfg = source(&zero_heads());
        assert_eq!(cfg.head_size(), 0);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let uneven = source(&BASE.replace("\"hidden_size\": 256", "\"hidden_size\": 250"));
        assert!(uneven.validate().is_err());
        assert!(source(BASE).validate().is_ok());
    }

    #[test]
    fn test_from_file_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_config.json");
        std::fs::write(&path, zero_heads()).unwrap();
        assert!(matches!(
            SourceConfig::from_file(&path),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_decoder_table() {
        assert_eq!("gptnext".parse::<DecoderType>().unwrap(), DecoderType::GptNext);
        assert_eq!(DecoderType::GptJ.architecture(), "GPTForCausalLM");
        assert_eq!(DecoderType::Llama.architecture(), "LLaMAForCausalLM");
        assert_eq!(DecoderType::Falcon.to_string(), "falcon");
        assert!(matches!(
            "bert".parse::<DecoderType>(),
            Err(Error::UnsupportedDecoder(_))
        ));
    }

    #[test]
    fn test_activation_mapping() {
        assert_eq!(non_gated_version("swiglu"), "silu");
        assert_eq!(non_gated_version("geglu"), "gelu");
        assert_eq!(non_gated_version("gelu"), "gelu");
        assert_eq!(resolve_hidden_act("fast-swiglu", false), "silu");
        assert_eq!(resolve_hidden_act("fast-swiglu", true), "swiglu");
        assert_eq!(resolve_hidden_act("squared-relu", true), "relu");
    }

    #[test]
    fn test_pad_vocab_size() {
        assert_eq!(pad_vocab_size(32000, 1), 32000);
        assert_eq!(pad_vocab_size(32001, 2), 32002);
        assert_eq!(pad_vocab_size(50257, 8), 50264);
    }

    #[test]
    fn test_moe_modes_serialize_as_integers() {
        let cfg = source(
            r#"{
            "num_layers": 2, "num_attention_heads": 4, "hidden_size": 64,
            "ffn_hidden_size": 128, "max_position_embeddings": 128,
            "num_moe_experts": 8, "moe_router_topk": 2, "moe_renorm_mode": 0,
            "activation": "fast-swiglu"
        }"#,
        );
        let built = ModelConfigBuilder::new(&cfg, DecoderType::Llama).build();
        assert_eq!(built.moe_normalization_mode, MoeNormalizationMode::None);
        assert_eq!(built.hidden_act, "swiglu");
        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(json["moe_normalization_mode"], 0);
        assert_eq!(json["moe_tp_mode"], 1);
        assert_eq!(json["moe_top_k"], 2);
    }

    #[test]
    fn test_build_llama() {
        let mut cfg = source(BASE);
        cfg.position_embedding_type = "rope".into();
        cfg.activation = "swiglu".into();
        cfg.num_query_groups = Some(2);

        let built = ModelConfigBuilder::new(&cfg, DecoderType::Llama)
            .dtype(DType::F16)
            .vocab_size(32002)
            .parallelism(2, 2)
            .build();

        assert_eq!(built.architecture, "LLaMAForCausalLM");
        assert_eq!(built.position_embedding_type, PositionEmbeddingType::RopeGptNeox);
        assert_eq!(built.hidden_act, "silu");
        assert_eq!(built.num_key_value_heads, 2);
        assert_eq!(built.world_size, 4);
        assert_eq!(built.new_decoder_architecture, None);

        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(json["dtype"], "float16");
        assert_eq!(json["logits_dtype"], "float32");
        assert_eq!(json["position_embedding_type"], "rope_gpt_neox");
        assert!(json["quantization"]["quant_algo"].is_null());
        assert!(json["quantization"]["kv_cache_quant_algo"].is_null());
        assert!(json.get("rotary_scaling").is_none());
        assert!(json.get("new_decoder_architecture").is_none());
        assert!(json.get("mapping").is_none());
    }

    #[test]
    fn test_rotary_scaling_emitted_when_present() {
        let mut cfg = source(BASE);
        cfg.seq_len_interpolation_factor = Some(4.0);
        let built = ModelConfigBuilder::new(&cfg, DecoderType::GptNext).build();
        let json = serde_json::to_value(&built).unwrap();
        assert_eq!(json["rotary_scaling"]["type"], "linear");
        assert_eq!(json["rotary_scaling"]["factor"], 4.0);
        assert_eq!(json["position_embedding_type"], "learned_absolute");
    }

    #[test]
    fn test_falcon_decoder_heuristic() {
        let mut cfg = source(BASE);
        cfg.num_layers = 32;
        let small = ModelConfigBuilder::new(&cfg, DecoderType::Falcon).build();
        assert_eq!(small.new_decoder_architecture, Some(false));
        assert_eq!(small.parallel_attention, Some(true));
        assert!(!small.uses_mlp_layernorm());

        cfg.num_layers = 60;
        let large = ModelConfigBuilder::new(&cfg, DecoderType::Falcon).build();
        assert_eq!(large.new_decoder_architecture, Some(true));
        assert!(large.uses_mlp_layernorm());
    }

    #[test]
    fn test_with_mapping_roundtrips_through_json() {
        let cfg = source(BASE);
        let built = ModelConfigBuilder::new(&cfg, DecoderType::Gemma)
            .vocab_size(256)
            .parallelism(2, 1)
            .build();
        let ranked = built.with_mapping(Mapping::new(2, 1, 2, 1).unwrap());
        let json = serde_json::to_string(&ranked).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ranked);
        assert_eq!(back.mapping.unwrap().tp_rank, 1);
    }
}
