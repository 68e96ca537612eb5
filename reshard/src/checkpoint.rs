//! `SafeTensors` checkpoint input and output.
//!
//! Source weights are read from one `.safetensors` file or every such file in
//! a directory. An engine checkpoint is a directory holding `config.json`
//! and one `rank{i}.safetensors` per rank.

#![allow(clippy::doc_markdown)]

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;

use crate::config::ModelConfig;
use crate::dtype::DType;
use crate::prompt::PromptWeights;
use crate::reshard::{SourceWeights, WeightMap};
use crate::tensor::HostTensor;
use crate::{Error, Result};

/// File name of the engine config inside a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";

/// Tensor name used for a converted prompt table.
pub const PROMPT_TABLE_TENSOR: &str = "prompt_table";

/// File name of a converted prompt table inside an output directory.
pub const PROMPT_TABLE_FILE: &str = "prompt_table.safetensors";

/// Name of the combined prompt embedding tensor in prompt weight files.
const PROMPT_EMBEDDINGS_TENSOR: &str = "prompt_embeddings_weights";

/// Weight file of one rank inside a checkpoint directory.
#[must_use]
pub fn rank_file_name(rank: usize) -> String {
    format!("rank{rank}.safetensors")
}

/// List the `.safetensors` files of `path`, or `path` itself if it is a file.
fn safetensors_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(std::result::Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(Error::SafeTensors(format!(
            "No .safetensors files in {}",
            path.display()
        )));
    }
    Ok(files)
}

/// Read every tensor of a file or directory into host memory.
///
/// Floating point tensors are converted to `cast_to` when it is set; integer
/// tensors are kept as they are.
///
/// # Errors
/// Returns an error if a file cannot be read or parsed, a dtype is not
/// supported, or a tensor name appears in more than one file.
pub fn load_flat_weights(path: &Path, cast_to: Option<DType>) -> Result<BTreeMap<String, HostTensor>> {
    let mut out = BTreeMap::new();

    for file_path in safetensors_files(path)? {
        let file = File::open(&file_path)?;
        // SAFETY: the file is opened read-only and only read while mapped.
        let mmap = unsafe { Mmap::map(&file)? };
        let st = SafeTensors::deserialize(&mmap).map_err(|e| {
            Error::SafeTensors(format!("Failed to parse {}: {e}", file_path.display()))
        })?;

        for (name, view) in st.tensors() {
            let dtype = DType::from_safetensors(view.dtype()).ok_or_else(|| {
                Error::UnsupportedDtype(format!("{:?} for tensor '{name}'", view.dtype()))
            })?;
            let mut tensor = HostTensor::new(view.shape().to_vec(), dtype, view.data().to_vec())?;
            if let Some(target) = cast_to.filter(|_| dtype.is_float()) {
                tensor = tensor.cast(target)?;
            }
            if out.insert(name.clone(), tensor).is_some() {
                return Err(Error::DuplicateWeightKey(name));
            }
        }

        tracing::debug!(path = %file_path.display(), tensors = out.len(), "loaded weights");
    }

    Ok(out)
}

/// Read and parse a flat source checkpoint.
///
/// # Errors
/// See [`load_flat_weights`] and [`SourceWeights::from_flat`].
pub fn load_source_weights(path: &Path, cast_to: Option<DType>) -> Result<SourceWeights> {
    SourceWeights::from_flat(load_flat_weights(path, cast_to)?)
}

/// Read prompt-tuning weights.
///
/// Tensors named `prompt_table.{task}.prompt_embeddings.weight` become
/// per-task tables; `prompt_embeddings_weights` is the combined table.
///
/// # Errors
/// See [`load_flat_weights`].
pub fn load_prompt_weights(path: &Path) -> Result<PromptWeights> {
    let mut weights = PromptWeights::default();
    for (name, tensor) in load_flat_weights(path, None)? {
        if name == PROMPT_EMBEDDINGS_TENSOR {
            weights.prompt_embeddings_weights = Some(tensor);
        } else if name.starts_with("prompt_table.") {
            weights.prompt_table.insert(name, tensor);
        }
    }
    Ok(weights)
}

/// Serialize named tensors into one `.safetensors` file.
///
/// # Errors
/// Returns an error if a tensor's bytes do not match its shape or the file
/// cannot be written.
pub fn write_tensors<'a, I>(path: &Path, tensors: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a HostTensor)>,
{
    let views = tensors
        .into_iter()
        .map(|(name, t)| {
            TensorView::new(t.dtype.to_safetensors(), t.shape.clone(), &t.data)
                .map(|view| (name, view))
                .map_err(|e| Error::SafeTensors(format!("invalid tensor {name}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(views, &None, path)?;
    Ok(())
}

/// Write an engine checkpoint: `config.json` plus one weight file per rank.
///
/// The config written is the rank-independent one; rank placement follows
/// from the weight file index.
///
/// # Errors
/// Returns an error if the two slices differ in length or are empty, or on
/// any I/O or serialization failure.
pub fn write_checkpoint(dir: &Path, weights: &[WeightMap], configs: &[ModelConfig]) -> Result<()> {
    if weights.len() != configs.len() || configs.is_empty() {
        return Err(Error::InvalidMapping(format!(
            "{} weight maps for {} configs",
            weights.len(),
            configs.len()
        )));
    }

    std::fs::create_dir_all(dir)?;

    let shared = ModelConfig {
        mapping: None,
        ..configs[0].clone()
    };
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&shared)?)?;

    for (rank, rank_weights) in weights.iter().enumerate() {
        let path = dir.join(rank_file_name(rank));
        write_tensors(
            &path,
            rank_weights.iter().map(|(name, t)| (name.as_str(), &**t)),
        )?;
        tracing::debug!(path = %path.display(), tensors = rank_weights.len(), "wrote rank weights");
    }

    tracing::info!(dir = %dir.display(), ranks = weights.len(), "wrote checkpoint");
    Ok(())
}

/// Write a stacked prompt table as `prompt_table.safetensors` under `dir`.
///
/// # Errors
/// Returns an error on any I/O or serialization failure.
pub fn write_prompt_table(dir: &Path, table: &HostTensor) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(PROMPT_TABLE_FILE);
    write_tensors(&path, [(PROMPT_TABLE_TENSOR, table)])?;
    tracing::debug!(path = %path.display(), shape = ?table.shape, "wrote prompt table");
    Ok(path)
}

/// Read the `config.json` of a checkpoint directory.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed.
pub fn read_checkpoint_config(dir: &Path) -> Result<ModelConfig> {
    let content = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
    Ok(serde_json::from_str(&content)?)
}
