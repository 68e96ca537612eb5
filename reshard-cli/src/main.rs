//! Command-line front end for checkpoint resharding
//!
//! Usage:
//!   # Reshard a flat checkpoint for 2-way tensor and 2-way pipeline parallelism:
//!   reshard convert -w weights/ -c model_config.json -o engine_ckpt/ \
//!       --decoder llama --tp-size 2 --pp-size 2
//!   # Stack per-task prompt tables:
//!   reshard prompt-table -c prompt_config.json -w prompt.safetensors -o out/
//!   # Encode stop words:
//!   reshard word-list -t tokenizer.json "hello, world"

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use reshard::checkpoint::{
    load_prompt_weights, load_source_weights, write_checkpoint, write_prompt_table,
};
use reshard::{
    model_to_trtllm_ckpt, prompt_convert, to_word_list_format, DType, DecoderType, ExportOptions,
    HfTokenizer, PromptConfig, SourceConfig, DEFAULT_REF_STR,
};

/// Convert flat decoder checkpoints into per-rank engine checkpoints
#[derive(Parser, Debug)]
#[command(name = "reshard")]
#[command(version)]
struct Cli {
    /// Log level used when `RUST_LOG` is not set
    #[arg(long, env = "RESHARD_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reshard source weights and write `config.json` plus one weight file per rank
    Convert {
        /// Source `.safetensors` file or directory of them
        #[arg(short, long, env = "RESHARD_WEIGHTS")]
        weights: PathBuf,

        /// Source model config (JSON)
        #[arg(short, long, env = "RESHARD_MODEL_CONFIG")]
        config: PathBuf,

        /// Output checkpoint directory
        #[arg(short, long)]
        output: PathBuf,

        /// Decoder family: gptj, gptnext, llama, gemma or falcon
        #[arg(short, long, env = "RESHARD_DECODER")]
        decoder: DecoderType,

        /// Weight dtype of the exported checkpoint
        #[arg(long, default_value = "bfloat16")]
        dtype: DType,

        /// Tensor-parallel degree
        #[arg(long, env = "RESHARD_TP_SIZE", default_value_t = 1)]
        tp_size: usize,

        /// Pipeline-parallel degree
        #[arg(long, env = "RESHARD_PP_SIZE", default_value_t = 1)]
        pp_size: usize,

        /// Shard embedding tables across tensor-parallel ranks
        #[arg(long)]
        parallel_embedding: bool,
    },

    /// Stack per-task prompt embeddings into one prompt table
    PromptTable {
        /// Prompt-tuning config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Prompt weights (`.safetensors` file or directory)
        #[arg(short, long)]
        weights: PathBuf,

        /// Output directory for `prompt_table.safetensors`
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Encode comma-separated word lists and print the id/offset array as JSON
    WordList {
        /// `tokenizer.json` or a directory containing it
        #[arg(short, long, env = "RESHARD_TOKENIZER")]
        tokenizer: PathBuf,

        /// Reference prefix used to encode words in mid-sentence form
        #[arg(long, default_value = DEFAULT_REF_STR)]
        ref_str: String,

        /// One comma-separated word list per batch entry
        #[arg(required = true)]
        words: Vec<String>,
    },
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))
}

fn run_convert(
    weights: &Path,
    config: &Path,
    output: &Path,
    options: &ExportOptions,
) -> Result<()> {
    let source = SourceConfig::from_file(config)
        .with_context(|| format!("Failed to read model config {}", config.display()))?;
    let weights = load_source_weights(weights, Some(options.dtype))
        .with_context(|| format!("Failed to load weights from {}", weights.display()))?;
    tracing::info!(
        tensors = weights.len(),
        decoder = %options.decoder_type,
        tp_size = options.tp_size,
        pp_size = options.pp_size,
        "loaded source checkpoint"
    );

    let (weights_dicts, model_configs) = model_to_trtllm_ckpt(&weights, &source, options)?;
    write_checkpoint(output, &weights_dicts, &model_configs)
        .with_context(|| format!("Failed to write checkpoint to {}", output.display()))?;
    Ok(())
}

fn run_prompt_table(config: &Path, weights: &Path, output: &Path) -> Result<()> {
    let prompt_config = PromptConfig::from_file(config)
        .with_context(|| format!("Failed to read prompt config {}", config.display()))?;
    let prompt_weights = load_prompt_weights(weights)
        .with_context(|| format!("Failed to load prompt weights from {}", weights.display()))?;

    let table = prompt_convert(&prompt_config, &prompt_weights)?;
    let path = write_prompt_table(output, &table)?;
    tracing::info!(path = %path.display(), shape = ?table.shape, "wrote prompt table");
    Ok(())
}

fn run_word_list(tokenizer: &Path, ref_str: &str, words: Vec<String>) -> Result<()> {
    let tokenizer = HfTokenizer::from_path(tokenizer)
        .with_context(|| format!("Failed to load tokenizer from {}", tokenizer.display()))?;
    let batch: Vec<Vec<String>> = words.into_iter().map(|w| vec![w]).collect();

    let tensor = to_word_list_format(&batch, &tokenizer, ref_str)?;
    let pad_to = tensor.shape[2];
    let rows: Vec<Vec<i32>> = tensor
        .to_i32_vec()
        .chunks(pad_to)
        .map(<[i32]>::to_vec)
        .collect();
    let nested: Vec<&[Vec<i32>]> = rows.chunks(2).collect();

    println!("{}", serde_json::to_string(&nested)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    match cli.command {
        Commands::Convert {
            weights,
            config,
            output,
            decoder,
            dtype,
            tp_size,
            pp_size,
            parallel_embedding,
        } => {
            let options = ExportOptions {
                decoder_type: decoder,
                dtype,
                tp_size,
                pp_size,
                use_parallel_embedding: parallel_embedding,
            };
            run_convert(&weights, &config, &output, &options)
        }
        Commands::PromptTable {
            config,
            weights,
            output,
        } => run_prompt_table(&config, &weights, &output),
        Commands::WordList {
            tokenizer,
            ref_str,
            words,
        } => run_word_list(&tokenizer, &ref_str, words),
    }
}
