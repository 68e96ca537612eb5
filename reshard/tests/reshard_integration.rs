//! End-to-end resharding of small synthetic checkpoints.
//!
//! Each test builds a flat source mapping in memory, reshards it and checks
//! the per-rank weight sets and configs.

use std::collections::BTreeSet;
use std::sync::Arc;

use reshard::checkpoint::{
    load_flat_weights, load_source_weights, read_checkpoint_config, rank_file_name,
    write_checkpoint, write_tensors,
};
use reshard::{
    model_to_trtllm_ckpt, BoundaryWeight, DType, DecoderType, Error, ExportOptions, HostTensor,
    SourceConfig, SourceWeights,
};

const HIDDEN: usize = 4;

fn filled(shape: Vec<usize>, seed: f32) -> HostTensor {
    let numel: usize = shape.iter().product();
    #[allow(clippy::cast_precision_loss)]
    let values: Vec<f32> = (0..numel).map(|i| seed + i as f32).collect();
    HostTensor::from_f32(shape, &values).unwrap()
}

fn source_config(num_layers: usize) -> SourceConfig {
    serde_json::from_value(serde_json::json!({
        "num_layers": num_layers,
        "num_attention_heads": 2,
        "hidden_size": HIDDEN,
        "ffn_hidden_size": 8,
        "max_position_embeddings": 32,
        "activation": "swiglu",
        "position_embedding_type": "rope",
    }))
    .unwrap()
}

/// A model with `num_layers` layers whose per-layer weights are pre-split
/// for `tp_size` ranks.
struct ModelBuilder {
    vocab: usize,
    num_layers: usize,
    tp_size: usize,
    position_embedding: bool,
    ln_f_bias: bool,
    post_layernorm: bool,
}

impl ModelBuilder {
    fn new(vocab: usize, num_layers: usize, tp_size: usize) -> Self {
        Self {
            vocab,
            num_layers,
            tp_size,
            position_embedding: false,
            ln_f_bias: false,
            post_layernorm: false,
        }
    }

    fn flat(&self) -> Vec<(String, HostTensor)> {
        let mut flat = vec![
            (
                "transformer.vocab_embedding.weight".to_string(),
                filled(vec![self.vocab, HIDDEN], 1.0),
            ),
            (
                "lm_head.weight".to_string(),
                filled(vec![self.vocab, HIDDEN], 1000.0),
            ),
            ("transformer.ln_f.weight".to_string(), filled(vec![HIDDEN], 0.5)),
        ];
        if self.position_embedding {
            flat.push((
                "transformer.position_embedding.weight".to_string(),
                filled(vec![32, HIDDEN], 0.0),
            ));
        }
        if self.ln_f_bias {
            flat.push(("transformer.ln_f.bias".to_string(), filled(vec![HIDDEN], 0.0)));
        }
        for layer in 0..self.num_layers {
            flat.push((
                format!("transformer.layers.{layer}.input_layernorm.weight"),
                filled(vec![HIDDEN], 0.0),
            ));
            if self.post_layernorm {
                flat.push((
                    format!("transformer.layers.{layer}.post_layernorm.weight"),
                    filled(vec![HIDDEN], 0.0),
                ));
            }
            for tp in 0..self.tp_size {
                #[allow(clippy::cast_precision_loss)]
                let seed = (layer * 100 + tp) as f32;
                flat.push((
                    format!("transformer.layers.{layer}.attention.dense.weight.{tp}.bin"),
                    filled(vec![HIDDEN / self.tp_size, HIDDEN], seed),
                ));
            }
        }
        flat
    }

    fn weights(&self) -> SourceWeights {
        SourceWeights::from_flat(self.flat()).unwrap()
    }
}

fn options(decoder: DecoderType, tp_size: usize, pp_size: usize) -> ExportOptions {
    ExportOptions {
        tp_size,
        pp_size,
        ..ExportOptions::new(decoder)
    }
}

fn keys(dict: &reshard::WeightMap) -> BTreeSet<&str> {
    dict.keys().map(String::as_str).collect()
}

#[test]
fn rank_count_matches_world_size() {
    for (tp, pp) in [(1, 1), (2, 1), (1, 2), (2, 2), (1, 4)] {
        let weights = ModelBuilder::new(8, 4, tp).weights();
        let (dicts, configs) =
            model_to_trtllm_ckpt(&weights, &source_config(4), &options(DecoderType::Llama, tp, pp))
                .unwrap();
        assert_eq!(dicts.len(), tp * pp);
        assert_eq!(configs.len(), tp * pp);
        for (rank, config) in configs.iter().enumerate() {
            let mapping = config.mapping.unwrap();
            assert_eq!(mapping.rank, rank);
            assert_eq!(config.world_size, tp * pp);
        }
    }
}

#[test]
fn boundary_weights_land_on_first_and_last_stage() {
    let weights = ModelBuilder::new(8, 4, 2).weights();
    let (dicts, configs) =
        model_to_trtllm_ckpt(&weights, &source_config(4), &options(DecoderType::Llama, 2, 2))
            .unwrap();

    for (dict, config) in dicts.iter().zip(&configs) {
        let mapping = config.mapping.unwrap();
        let first = mapping.pp_rank == 0;
        assert_eq!(dict.contains_key("transformer.vocab_embedding.weight"), first);
        assert_eq!(dict.contains_key("lm_head.weight"), !first);
        assert_eq!(dict.contains_key("transformer.ln_f.weight"), !first);
    }
}

#[test]
fn layers_are_renumbered_per_stage() {
    let weights = ModelBuilder::new(8, 4, 2).weights();
    let (dicts, configs) =
        model_to_trtllm_ckpt(&weights, &source_config(4), &options(DecoderType::Llama, 2, 2))
            .unwrap();

    for (dict, config) in dicts.iter().zip(&configs) {
        let mapping = config.mapping.unwrap();
        let layer_keys: Vec<&str> = keys(dict)
            .into_iter()
            .filter(|k| k.starts_with("transformer.layers."))
            .collect();
        assert_eq!(
            layer_keys,
            vec![
                "transformer.layers.0.attention.dense.weight",
                "transformer.layers.0.input_layernorm.weight",
                "transformer.layers.1.attention.dense.weight",
                "transformer.layers.1.input_layernorm.weight",
            ]
        );

        // The stage's second layer is global layer 2 * pp_rank + 1; its
        // dense weight is the variant pre-split for this tp rank.
        let global = 2 * mapping.pp_rank + 1;
        let dense = dict["transformer.layers.1.attention.dense.weight"].to_f32_vec();
        #[allow(clippy::cast_precision_loss)]
        let expected_seed = (global * 100 + mapping.tp_rank) as f32;
        assert!((dense[0] - expected_seed).abs() < f32::EPSILON);
    }
}

#[test]
fn vocab_padding_appends_zero_rows() {
    let weights = ModelBuilder::new(7, 2, 1).weights();
    let source_lm_head = weights.boundary(BoundaryWeight::LmHead).unwrap().to_f32_vec();
    let mut opts = options(DecoderType::GptNext, 2, 1);
    opts.use_parallel_embedding = true;

    let (dicts, configs) = model_to_trtllm_ckpt(&weights, &source_config(2), &opts).unwrap();
    assert_eq!(configs[0].vocab_size, 8);

    let mut lm_head = dicts[0]["lm_head.weight"].to_f32_vec();
    lm_head.extend(dicts[1]["lm_head.weight"].to_f32_vec());
    assert_eq!(lm_head.len(), 8 * HIDDEN);
    assert_eq!(&lm_head[..7 * HIDDEN], source_lm_head.as_slice());
    assert!(lm_head[7 * HIDDEN..].iter().all(|&v| v == 0.0));

    let tail = dicts[1]["transformer.vocab_embedding.weight"].to_f32_vec();
    assert!(tail[3 * HIDDEN..].iter().all(|&v| v == 0.0));
}

#[test]
fn replicated_embedding_is_shared() {
    let weights = ModelBuilder::new(8, 2, 2).weights();
    let (dicts, _) =
        model_to_trtllm_ckpt(&weights, &source_config(2), &options(DecoderType::Llama, 2, 1))
            .unwrap();

    let source = weights.boundary(BoundaryWeight::VocabEmbedding).unwrap();
    for dict in &dicts {
        assert!(Arc::ptr_eq(&dict["transformer.vocab_embedding.weight"], source));
        assert_eq!(dict["lm_head.weight"].shape, vec![4, HIDDEN]);
    }
}

#[test]
fn optional_boundary_weights() {
    let mut builder = ModelBuilder::new(8, 2, 1);
    let (dicts, _) = model_to_trtllm_ckpt(
        &builder.weights(),
        &source_config(2),
        &options(DecoderType::GptNext, 1, 1),
    )
    .unwrap();
    assert!(!dicts[0].contains_key("transformer.position_embedding.weight"));
    assert!(!dicts[0].contains_key("transformer.ln_f.bias"));

    builder.position_embedding = true;
    builder.ln_f_bias = true;
    let (dicts, _) = model_to_trtllm_ckpt(
        &builder.weights(),
        &source_config(2),
        &options(DecoderType::GptNext, 1, 2),
    )
    .unwrap();
    assert!(dicts[0].contains_key("transformer.position_embedding.weight"));
    assert!(!dicts[0].contains_key("transformer.ln_f.bias"));
    assert!(dicts[1].contains_key("transformer.ln_f.bias"));
    assert!(!dicts[1].contains_key("transformer.position_embedding.weight"));
}

#[test]
fn falcon_layer_count_selects_decoder_architecture() {
    for (num_layers, new_arch) in [(32, false), (60, true)] {
        let mut builder = ModelBuilder::new(8, num_layers, 1);
        builder.post_layernorm = true;
        let (dicts, configs) = model_to_trtllm_ckpt(
            &builder.weights(),
            &source_config(num_layers),
            &options(DecoderType::Falcon, 1, 2),
        )
        .unwrap();

        for (dict, config) in dicts.iter().zip(&configs) {
            assert_eq!(config.new_decoder_architecture, Some(new_arch));
            assert_eq!(config.parallel_attention, Some(true));
            assert_eq!(config.architecture, "FalconForCausalLM");
            let renamed = dict.keys().any(|k| k.contains("mlp_layernorm"));
            let original = dict.keys().any(|k| k.contains("post_layernorm"));
            assert_eq!(renamed, new_arch);
            assert_eq!(original, !new_arch);
        }
    }
}

#[test]
fn non_falcon_configs_omit_falcon_fields() {
    let (_, configs) = model_to_trtllm_ckpt(
        &ModelBuilder::new(8, 2, 1).weights(),
        &source_config(2),
        &options(DecoderType::Llama, 1, 1),
    )
    .unwrap();
    let json = serde_json::to_value(&configs[0]).unwrap();
    assert!(json.get("new_decoder_architecture").is_none());
    assert!(json.get("parallel_attention").is_none());
    assert!(json.get("rotary_scaling").is_none());
    assert_eq!(json["hidden_act"], "silu");
    assert_eq!(json["position_embedding_type"], "rope_gpt_neox");
    assert_eq!(json["quantization"]["quant_algo"], serde_json::Value::Null);
    assert_eq!(json["moe_normalization_mode"], 1);
}

#[test]
fn indivisible_tp_split_is_rejected() {
    let mut flat = ModelBuilder::new(8, 2, 1).flat();
    flat.push((
        "transformer.position_embedding.weight".to_string(),
        filled(vec![3, HIDDEN], 0.0),
    ));
    let weights = SourceWeights::from_flat(flat).unwrap();
    let mut opts = options(DecoderType::GptNext, 2, 1);
    opts.use_parallel_embedding = true;
    assert!(matches!(
        model_to_trtllm_ckpt(&weights, &source_config(2), &opts),
        Err(Error::ShapeMismatch { .. })
    ));
}

#[test]
fn checkpoint_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("source.safetensors");
    let flat = ModelBuilder::new(8, 2, 2).flat();
    write_tensors(&source_path, flat.iter().map(|(k, t)| (k.as_str(), t))).unwrap();

    let weights = load_source_weights(&source_path, Some(DType::F16)).unwrap();
    let mut opts = options(DecoderType::Llama, 2, 1);
    opts.dtype = DType::F16;
    let (dicts, configs) = model_to_trtllm_ckpt(&weights, &source_config(2), &opts).unwrap();

    let out = dir.path().join("engine");
    write_checkpoint(&out, &dicts, &configs).unwrap();

    let config = read_checkpoint_config(&out).unwrap();
    assert!(config.mapping.is_none());
    assert_eq!(config.dtype, DType::F16);
    assert_eq!(config.tp_size, 2);

    for (rank, dict) in dicts.iter().enumerate() {
        let loaded = load_flat_weights(&out.join(rank_file_name(rank)), None).unwrap();
        assert_eq!(loaded.len(), dict.len());
        for (name, tensor) in dict {
            assert_eq!(&loaded[name], &**tensor);
            assert_eq!(loaded[name].dtype, DType::F16);
        }
    }
}

#[test]
fn tp_tag_beyond_tp_size_is_rejected() {
    // Pre-split for four ranks, exported for two.
    let weights = ModelBuilder::new(8, 2, 4).weights();
    let err = model_to_trtllm_ckpt(&weights, &source_config(2), &options(DecoderType::Llama, 2, 1))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWeightKey(msg) if msg.contains("tp rank 2")));

    assert!(model_to_trtllm_ckpt(
        &weights,
        &source_config(2),
        &options(DecoderType::Llama, 4, 1)
    )
    .is_ok());
}

#[test]
fn vocab_padding_with_replicated_embedding() {
    let weights = ModelBuilder::new(7, 2, 1).weights();
    let source_embedding = weights.boundary(BoundaryWeight::VocabEmbedding).unwrap();
    let (dicts, configs) =
        model_to_trtllm_ckpt(&weights, &source_config(2), &options(DecoderType::Llama, 2, 1))
            .unwrap();

    assert_eq!(configs[0].vocab_size, 8);
    for dict in &dicts {
        let embedding = &dict["transformer.vocab_embedding.weight"];
        assert_eq!(embedding.shape, vec![7, HIDDEN]);
        assert!(Arc::ptr_eq(embedding, source_embedding));
        assert_eq!(dict["lm_head.weight"].shape, vec![4, HIDDEN]);
    }

    let tail = dicts[1]["lm_head.weight"].to_f32_vec();
    assert!(tail[3 * HIDDEN..].iter().all(|&v| v == 0.0));
    assert!(tail[..3 * HIDDEN].iter().all(|&v| v >= 1000.0));
}
