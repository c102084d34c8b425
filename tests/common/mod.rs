#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use axum::body::Body;
use axum::http::{Request, Response};
use candle_core::{DType, Device, Tensor};
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;

use textgen_serve::llm::loader::ModelFiles;

pub const HIDDEN: usize = 8;
pub const INTERMEDIATE: usize = 16;
pub const LAYERS: usize = 2;
pub const HEADS: usize = 2;
pub const KV_HEADS: usize = 1;
pub const VOCAB: usize = 6;

const TOKENIZER_JSON: &str = r#"{
  "version": "1.0",
  "truncation": null,
  "padding": null,
  "added_tokens": [
    {"id": 0, "content": "<s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
    {"id": 1, "content": "</s>", "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
  ],
  "normalizer": null,
  "pre_tokenizer": {"type": "Whitespace"},
  "post_processor": null,
  "decoder": null,
  "model": {
    "type": "WordLevel",
    "vocab": {"<s>": 0, "</s>": 1, "<unk>": 2, "hello": 3, "world": 4, "again": 5},
    "unk_token": "<unk>"
  }
}"#;

fn config_json(overrides: Value) -> String {
    let mut config = serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": HEADS,
        "num_key_value_heads": KV_HEADS,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "hidden_act": "silu",
        "max_position_embeddings": 64,
        "vocab_size": VOCAB,
        "tie_word_embeddings": false,
        "bos_token_id": 0,
        "eos_token_id": 1
    });
    if let (Some(config), Value::Object(overrides)) = (config.as_object_mut(), overrides) {
        config.extend(overrides);
    }
    config.to_string()
}

fn random(shape: (usize, usize)) -> Tensor {
    Tensor::randn(0f32, 0.3f32, shape, &Device::Cpu).unwrap()
}

fn ones(len: usize) -> Tensor {
    Tensor::ones(len, DType::F32, &Device::Cpu).unwrap()
}

fn write_weights(path: &Path) {
    let head_dim = HIDDEN / HEADS;
    let kv_dim = KV_HEADS * head_dim;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert("model.embed_tokens.weight".into(), random((VOCAB, HIDDEN)));
    for layer in 0..LAYERS {
        let p = format!("model.layers.{layer}");
        tensors.insert(format!("{p}.self_attn.q_proj.weight"), random((HIDDEN, HIDDEN)));
        tensors.insert(format!("{p}.self_attn.k_proj.weight"), random((kv_dim, HIDDEN)));
        tensors.insert(format!("{p}.self_attn.v_proj.weight"), random((kv_dim, HIDDEN)));
        tensors.insert(format!("{p}.self_attn.o_proj.weight"), random((HIDDEN, HIDDEN)));
        tensors.insert(format!("{p}.mlp.gate_proj.weight"), random((INTERMEDIATE, HIDDEN)));
        tensors.insert(format!("{p}.mlp.up_proj.weight"), random((INTERMEDIATE, HIDDEN)));
        tensors.insert(format!("{p}.mlp.down_proj.weight"), random((HIDDEN, INTERMEDIATE)));
        tensors.insert(format!("{p}.input_layernorm.weight"), ones(HIDDEN));
        tensors.insert(format!("{p}.post_attention_layernorm.weight"), ones(HIDDEN));
    }
    tensors.insert("model.norm.weight".into(), ones(HIDDEN));
    tensors.insert("lm_head.weight".into(), random((VOCAB, HIDDEN)));

    candle_core::safetensors::save(&tensors, path).unwrap();
}

/// A randomly initialised two-layer Llama checkpoint with a word-level
/// tokenizer, written to a temporary directory.
pub struct TinyCheckpoint {
    _dir: TempDir,
    pub files: ModelFiles,
}

impl TinyCheckpoint {
    pub fn new() -> Self {
        Self::with_config(Value::Null)
    }

    /// Same checkpoint with top-level `config.json` keys replaced.
    pub fn with_config(overrides: Value) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        let tokenizer = dir.path().join("tokenizer.json");
        let weights = dir.path().join("model.safetensors");

        std::fs::write(&config, config_json(overrides)).unwrap();
        std::fs::write(&tokenizer, TOKENIZER_JSON).unwrap();
        write_weights(&weights);

        Self {
            _dir: dir,
            files: ModelFiles {
                config,
                tokenizer,
                weights: vec![weights],
            },
        }
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
