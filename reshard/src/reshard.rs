//! Per-rank resharding of a flat source checkpoint.
//!
//! The source mapping holds every weight of the model once (tensor-parallel
//! weights already come pre-split as `.{tp_rank}.bin` variants). For each
//! rank of a `tp_size × pp_size` grid this module selects that rank's
//! variants, keeps only the layers of its pipeline stage, renumbers them from
//! zero, and attaches the embedding on the first stage and the output head on
//! the last.

use std::borrow::Cow;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::{pad_vocab_size, DecoderType, ModelConfig, ModelConfigBuilder, SourceConfig};
use crate::dtype::DType;
use crate::key::{BoundaryWeight, SourceKey, WeightKind};
use crate::mapping::Mapping;
use crate::shard::split;
use crate::tensor::HostTensor;
use crate::{Error, Result};

/// Engine-facing weights of one rank, keyed by engine name.
///
/// Tensors replicated across ranks share one allocation.
pub type WeightMap = BTreeMap<String, Arc<HostTensor>>;

/// Target layout and encoding of the exported checkpoint.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub decoder_type: DecoderType,
    /// Weight dtype recorded in the config
    pub dtype: DType,
    pub tp_size: usize,
    pub pp_size: usize,
    /// Shard the embedding tables across tp ranks instead of replicating them
    pub use_parallel_embedding: bool,
}

impl ExportOptions {
    /// Single-rank `bfloat16` export for `decoder_type`.
    #[must_use]
    pub fn new(decoder_type: DecoderType) -> Self {
        Self {
            decoder_type,
            dtype: DType::BF16,
            tp_size: 1,
            pp_size: 1,
            use_parallel_embedding: false,
        }
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.tp_size * self.pp_size
    }
}

/// A flat source checkpoint with its keys parsed.
#[derive(Debug, Clone, Default)]
pub struct SourceWeights {
    entries: Vec<(SourceKey, Arc<HostTensor>)>,
    boundary: BTreeMap<BoundaryWeight, Arc<HostTensor>>,
}

impl SourceWeights {
    /// Parse every key of a flat `name → tensor` mapping.
    ///
    /// # Errors
    /// Returns an error if a key is malformed or appears twice.
    pub fn from_flat<I>(weights: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, HostTensor)>,
    {
        let mut out = Self::default();
        let mut seen = HashSet::new();
        for (name, tensor) in weights {
            let key = SourceKey::parse(&name)?;
            if !seen.insert(name.clone()) {
                return Err(Error::DuplicateWeightKey(name));
            }
            let tensor = Arc::new(tensor);
            match key.kind {
                WeightKind::Boundary(b) => {
                    out.boundary.insert(b, tensor);
                }
                _ => out.entries.push((key, tensor)),
            }
        }
        Ok(out)
    }

    /// Look up a pipeline-boundary weight.
    #[must_use]
    pub fn boundary(&self, weight: BoundaryWeight) -> Option<&Arc<HostTensor>> {
        self.boundary.get(&weight)
    }

    fn require(&self, weight: BoundaryWeight) -> Result<&Arc<HostTensor>> {
        self.boundary(weight)
            .ok_or_else(|| Error::WeightNotFound(weight.key().to_string()))
    }

    /// Number of source tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() + self.boundary.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows of the vocabulary embedding, i.e. the unpadded vocabulary size.
    ///
    /// # Errors
    /// Returns an error if the embedding is missing or is a scalar.
    pub fn vocab_size(&self) -> Result<usize> {
        let embedding = self.require(BoundaryWeight::VocabEmbedding)?;
        embedding.shape.first().copied().ok_or_else(|| {
            Error::InvalidShape(format!(
                "{} has no rows",
                BoundaryWeight::VocabEmbedding
            ))
        })
    }
}

/// Row-slice `tensor` for this rank, sharing it when `tp_size == 1`.
fn shard_rows(tensor: &Arc<HostTensor>, mapping: &Mapping) -> Result<Arc<HostTensor>> {
    Ok(match split(tensor, mapping.tp_size, mapping.tp_rank, 0)? {
        Cow::Borrowed(_) => Arc::clone(tensor),
        Cow::Owned(slice) => Arc::new(slice),
    })
}

fn insert_unique(map: &mut WeightMap, name: String, tensor: Arc<HostTensor>) -> Result<()> {
    match map.entry(name) {
        Entry::Vacant(slot) => {
            slot.insert(tensor);
            Ok(())
        }
        Entry::Occupied(slot) => Err(Error::DuplicateWeightKey(slot.key().clone())),
    }
}

/// Build the per-rank weights and configs of an engine checkpoint.
///
/// Returns `(weights, configs)` with one entry per rank, index aligned:
/// `weights[i]` belongs to the rank described by `configs[i].mapping`.
///
/// # Errors
/// Returns an error if the source config or the layout is invalid
/// (`num_layers < pp_size`, zero-sized parallelism), a required weight
/// (vocabulary embedding, `lm_head`, final norm weight) is missing, a layer
/// index or tp tag is out of range, two source keys collapse onto one engine
/// key, or a tensor cannot be split evenly across `tp_size`.
pub fn model_to_trtllm_ckpt(
    weights: &SourceWeights,
    source: &SourceConfig,
    options: &ExportOptions,
) -> Result<(Vec<WeightMap>, Vec<ModelConfig>)> {
    let world_size = options.world_size();
    if world_size == 0 {
        return Err(Error::InvalidMapping(format!(
            "tp_size ({}) and pp_size ({}) must be positive",
            options.tp_size, options.pp_size
        )));
    }

    source.validate()?;

    let num_layers = source.num_layers;
    if let Some((key, _)) = weights
        .entries
        .iter()
        .find(|(key, _)| key.layer().is_some_and(|l| l >= num_layers))
    {
        return Err(Error::InvalidWeightKey(format!(
            "{} refers to a layer beyond num_layers = {num_layers}",
            key.render(0, false)
        )));
    }

    if let Some((key, rank)) = weights
        .entries
        .iter()
        .find_map(|(key, _)| key.tp_rank.filter(|&r| r >= options.tp_size).map(|r| (key, r)))
    {
        return Err(Error::InvalidWeightKey(format!(
            "{} is pre-split for tp rank {rank}, beyond tp_size = {}",
            key.render(0, false),
            options.tp_size
        )));
    }

    let vocab_size = weights.vocab_size()?;
    let vocab_size_padded = pad_vocab_size(vocab_size, options.tp_size);

    let mut vocab_embedding = Arc::clone(weights.require(BoundaryWeight::VocabEmbedding)?);
    let mut lm_head = Arc::clone(weights.require(BoundaryWeight::LmHead)?);
    let ln_f_weight = weights.require(BoundaryWeight::FinalNormWeight)?;
    let ln_f_bias = weights.boundary(BoundaryWeight::FinalNormBias);
    let position_embedding = weights.boundary(BoundaryWeight::PositionEmbedding);

    if vocab_size_padded != vocab_size {
        tracing::info!(
            vocab_size,
            vocab_size_padded,
            "padding vocabulary for tensor parallelism"
        );
        lm_head = Arc::new(lm_head.pad_rows(vocab_size_padded)?);
        if options.use_parallel_embedding {
            vocab_embedding = Arc::new(vocab_embedding.pad_rows(vocab_size_padded)?);
        }
    }

    let config = ModelConfigBuilder::new(source, options.decoder_type)
        .dtype(options.dtype)
        .vocab_size(vocab_size_padded)
        .parallelism(options.tp_size, options.pp_size)
        .use_parallel_embedding(options.use_parallel_embedding)
        .build();
    let mlp_layernorm = config.uses_mlp_layernorm();

    let mut weights_dicts = Vec::with_capacity(world_size);
    let mut model_configs = Vec::with_capacity(world_size);

    for rank in 0..world_size {
        let mapping = Mapping::new(world_size, rank, options.tp_size, options.pp_size)?;
        let layers_range = mapping.pp_layers(num_layers)?;

        let mut local = WeightMap::new();
        for (key, tensor) in &weights.entries {
            if !key.belongs_to_tp_rank(mapping.tp_rank) {
                continue;
            }
            if key.layer().is_some_and(|layer| !layers_range.contains(&layer)) {
                continue;
            }
            let name = key.render(layers_range.start, mlp_layernorm);
            insert_unique(&mut local, name, Arc::clone(tensor))?;
        }

        if mapping.is_first_pp_rank() {
            let embedding = if options.use_parallel_embedding {
                shard_rows(&vocab_embedding, &mapping)?
            } else {
                Arc::clone(&vocab_embedding)
            };
            insert_unique(
                &mut local,
                BoundaryWeight::VocabEmbedding.key().to_string(),
                embedding,
            )?;

            if let Some(pos) = position_embedding {
                let pos = if options.use_parallel_embedding {
                    shard_rows(pos, &mapping)?
                } else {
                    Arc::clone(pos)
                };
                insert_unique(
                    &mut local,
                    BoundaryWeight::PositionEmbedding.key().to_string(),
                    pos,
                )?;
            }
        }

        if mapping.is_last_pp_rank() {
            insert_unique(
                &mut local,
                BoundaryWeight::LmHead.key().to_string(),
                shard_rows(&lm_head, &mapping)?,
            )?;
            insert_unique(
                &mut local,
                BoundaryWeight::FinalNormWeight.key().to_string(),
                Arc::clone(ln_f_weight),
            )?;
            if let Some(bias) = ln_f_bias {
                insert_unique(
                    &mut local,
                    BoundaryWeight::FinalNormBias.key().to_string(),
                    Arc::clone(bias),
                )?;
            }
        }

        tracing::info!(
            rank,
            tp_rank = mapping.tp_rank,
            pp_rank = mapping.pp_rank,
            layers = ?layers_range,
            tensors = local.len(),
            "resharded rank"
        );

        weights_dicts.push(local);
        model_configs.push(config.with_mapping(mapping));
    }

    Ok((weights_dicts, model_configs))
}
