//! Structured weight keys.
//!
//! Source checkpoints encode metadata in flat string keys:
//!
//! - `transformer.layers.{i}.attention.qkv.weight` carries a global layer index
//! - `....{tp_rank}.bin` marks a variant already split for one tensor-parallel rank
//! - a handful of fixed names live on the first or last pipeline stage only
//!
//! [`SourceKey::parse`] lifts that into types once, and [`SourceKey::render`]
//! turns it back into the engine's string form for a given rank.

use std::fmt;

use crate::{Error, Result};

const TP_SUFFIX: &str = ".bin";
const LAYERS_SEGMENT: &str = "layers";

/// Weights that are attached only to the first or last pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BoundaryWeight {
    VocabEmbedding,
    PositionEmbedding,
    LmHead,
    FinalNormWeight,
    FinalNormBias,
}

impl BoundaryWeight {
    pub const ALL: [Self; 5] = [
        Self::VocabEmbedding,
        Self::PositionEmbedding,
        Self::LmHead,
        Self::FinalNormWeight,
        Self::FinalNormBias,
    ];

    /// Engine key for this weight.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::VocabEmbedding => "transformer.vocab_embedding.weight",
            Self::PositionEmbedding => "transformer.position_embedding.weight",
            Self::LmHead => "lm_head.weight",
            Self::FinalNormWeight => "transformer.ln_f.weight",
            Self::FinalNormBias => "transformer.ln_f.bias",
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.key() == key)
    }
}

impl fmt::Display for BoundaryWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// What a source weight is, independent of which tp rank it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightKind {
    /// One of the pipeline-boundary weights.
    Boundary(BoundaryWeight),
    /// A weight inside transformer block `layer`.
    ///
    /// `prefix` is everything before the index (`transformer.layers`),
    /// `param` everything after it (`attention.dense.weight`).
    Layer {
        prefix: String,
        layer: usize,
        param: String,
    },
    /// Any other weight, copied to every rank under its own name.
    Global(String),
}

/// A parsed source key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceKey {
    pub kind: WeightKind,
    /// Tensor-parallel rank this variant was pre-split for, if any.
    pub tp_rank: Option<usize>,
}

impl SourceKey {
    /// Parse a flat source key.
    ///
    /// A `.bin` suffix without a numeric rank in front of it is not a tp tag;
    /// such keys are kept whole and shared by every rank.
    ///
    /// # Errors
    /// Returns an error if a layer key has nothing after its index.
    pub fn parse(raw: &str) -> Result<Self> {
        let (base, tp_rank) = match split_tp_tag(raw) {
            Some((base, rank)) => (base, Some(rank)),
            None => (raw, None),
        };

        if tp_rank.is_none() {
            if let Some(boundary) = BoundaryWeight::from_key(base) {
                return Ok(Self {
                    kind: WeightKind::Boundary(boundary),
                    tp_rank,
                });
            }
        }

        let kind = match parse_layer(base) {
            Some((prefix, layer, param)) => {
                if param.is_empty() {
                    return Err(Error::InvalidWeightKey(raw.to_string()));
                }
                WeightKind::Layer {
                    prefix: prefix.to_string(),
                    layer,
                    param: param.to_string(),
                }
            }
            None => WeightKind::Global(base.to_string()),
        };
        Ok(Self { kind, tp_rank })
    }

    /// Global layer index, for per-layer weights.
    #[must_use]
    pub fn layer(&self) -> Option<usize> {
        match self.kind {
            WeightKind::Layer { layer, .. } => Some(layer),
            _ => None,
        }
    }

    /// Whether a rank with tensor-parallel rank `tp_rank` should see this key.
    ///
    /// Untagged keys are shared by all tp ranks; tagged ones only by their own.
    #[must_use]
    pub fn belongs_to_tp_rank(&self, tp_rank: usize) -> bool {
        self.tp_rank.map_or(true, |r| r == tp_rank)
    }

    /// Engine key on a rank whose pipeline stage starts at `first_layer`.
    ///
    /// Drops the tp suffix, rebases the layer index, and with
    /// `mlp_layernorm` set renames `post_layernorm` to `mlp_layernorm`.
    #[must_use]
    pub fn render(&self, first_layer: usize, mlp_layernorm: bool) -> String {
        let key = match &self.kind {
            WeightKind::Boundary(b) => b.key().to_string(),
            WeightKind::Layer {
                prefix,
                layer,
                param,
            } => format!("{prefix}.{}.{param}", layer - first_layer),
            WeightKind::Global(name) => name.clone(),
        };
        if mlp_layernorm && key.contains("post_layernorm") {
            key.replace("post_layernorm", "mlp_layernorm")
        } else {
            key
        }
    }
}

/// Split `name.{rank}.bin` into (`name`, rank).
fn split_tp_tag(raw: &str) -> Option<(&str, usize)> {
    let (base, tag) = raw.strip_suffix(TP_SUFFIX)?.rsplit_once('.')?;
    Some((base, tag.parse().ok()?))
}

/// Split `a.b.layers.7.rest` into (`a.b.layers`, 7, `rest`).
fn parse_layer(key: &str) -> Option<(&str, usize, &str)> {
    let mut offset = 0;
    let mut segments = key.split('.').peekable();
    while let Some(segment) = segments.next() {
        offset += segment.len() + 1;
        if segment != LAYERS_SEGMENT {
            continue;
        }
        let Some(index) = segments.peek() else {
            return None;
        };
        if let Ok(layer) = index.parse::<usize>() {
            let prefix = &key[..offset - 1];
            let rest_start = (offset + index.len() + 1).min(key.len());
            return Some((prefix, layer, &key[rest_start..]));
        }
    }
    None
}
