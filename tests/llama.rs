mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, IndexOp, Tensor};
use serde_json::json;
use tower::ServiceExt;

use common::{body_json, json_request, TinyCheckpoint, VOCAB};
use textgen_serve::api::create_router;
use textgen_serve::llm::causal_self_attention::KVCache;
use textgen_serve::llm::loader;
use textgen_serve::llm::models::{LlamaModel, Model};
use textgen_serve::llm::{DeviceKind, GenerationParams, TextGenerator};
use textgen_serve::AppState;

fn build_model(checkpoint: &TinyCheckpoint) -> LlamaModel {
    let cfg = loader::load_model_config(&checkpoint.files.config).unwrap();
    let weights = unsafe { MmapedSafetensors::multi(checkpoint.files.weights.as_slice()).unwrap() };
    LlamaModel::new(&weights, &cfg, &Device::Cpu, DType::F32).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

fn params(prompt: &str, max_length: usize, seed: u64) -> GenerationParams {
    GenerationParams {
        prompt: prompt.to_string(),
        max_length,
        temperature: 0.8,
        seed: Some(seed),
    }
}

#[test]
fn forward_produces_vocab_logits() {
    let checkpoint = TinyCheckpoint::new();
    let model = build_model(&checkpoint);
    assert_eq!(model.num_layers(), common::LAYERS);

    let ids = Tensor::new(&[[3u32, 4, 5]], &Device::Cpu).unwrap();
    let logits = model.forward(&ids).unwrap();
    assert_eq!(logits.dims(), &[1, 3, VOCAB]);
}

#[test]
fn cached_decoding_matches_full_forward() {
    let checkpoint = TinyCheckpoint::new();
    let model = build_model(&checkpoint);

    let full = model
        .forward(&Tensor::new(&[[0u32, 3, 4, 5, 3]], &Device::Cpu).unwrap())
        .unwrap();

    let mut caches = vec![KVCache::new(); model.num_layers()];
    let prompt = Tensor::new(&[[0u32, 3, 4]], &Device::Cpu).unwrap();
    let first = model.forward_with_cache(&prompt, &mut caches, 0).unwrap();
    assert!(max_abs_diff(&first.i((0, 2)).unwrap(), &full.i((0, 2)).unwrap()) < 1e-4);

    let step = model
        .forward_with_cache(&Tensor::new(&[[5u32]], &Device::Cpu).unwrap(), &mut caches, 3)
        .unwrap();
    assert!(max_abs_diff(&step.i((0, 0)).unwrap(), &full.i((0, 3)).unwrap()) < 1e-4);

    let step = model
        .forward_with_cache(&Tensor::new(&[[3u32]], &Device::Cpu).unwrap(), &mut caches, 4)
        .unwrap();
    assert!(max_abs_diff(&step.i((0, 0)).unwrap(), &full.i((0, 4)).unwrap()) < 1e-4);

    assert_eq!(caches[0].seq_len().unwrap(), 5);
}

#[test]
fn wrong_number_of_caches_is_an_error() {
    let checkpoint = TinyCheckpoint::new();
    let model = build_model(&checkpoint);

    let mut caches = vec![KVCache::new(); 1];
    let ids = Tensor::new(&[[3u32]], &Device::Cpu).unwrap();
    assert!(model.forward_with_cache(&ids, &mut caches, 0).is_err());
}

#[test]
fn position_must_follow_the_cache() {
    let checkpoint = TinyCheckpoint::new();
    let model = build_model(&checkpoint);

    let mut caches = vec![KVCache::new(); model.num_layers()];
    let prompt = Tensor::new(&[[0u32, 3]], &Device::Cpu).unwrap();
    model.forward_with_cache(&prompt, &mut caches, 0).unwrap();

    let next = Tensor::new(&[[4u32]], &Device::Cpu).unwrap();
    assert!(model.forward_with_cache(&next, &mut caches, 5).is_err());
    assert!(model.forward_with_cache(&next, &mut caches, 2).is_ok());
}

#[test]
fn generator_keeps_prompt_and_respects_max_length() {
    let checkpoint = TinyCheckpoint::new();
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();
    assert_eq!(generator.stop_token_ids(), &[1]);
    assert_eq!(generator.encode("hello world").unwrap(), vec![3, 4]);

    let text = generator.generate(&params("hello world", 6, 11)).unwrap();
    assert!(text.starts_with("hello world"), "{text}");
    assert!(text.split_whitespace().count() <= 6, "{text}");
}

#[test]
fn llama3_style_config_loads_and_generates() {
    let checkpoint = TinyCheckpoint::with_config(json!({
        "eos_token_id": [1, 5],
        "rope_theta": 500000.0,
        "rope_scaling": {
            "factor": 8.0,
            "low_freq_factor": 1.0,
            "high_freq_factor": 4.0,
            "original_max_position_embeddings": 16,
            "rope_type": "llama3"
        }
    }));
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();
    assert_eq!(generator.stop_token_ids(), &[1, 5]);

    let text = generator.generate(&params("hello world", 12, 4)).unwrap();
    assert!(text.starts_with("hello world"), "{text}");
    assert!(!text.contains("again"), "{text}");
}

#[test]
fn rope_scaling_changes_the_logits() {
    let plain = TinyCheckpoint::new();
    let scaled = TinyCheckpoint::with_config(json!({
        "rope_scaling": {"type": "linear", "factor": 4.0}
    }));
    // Same weights, different positional frequencies.
    std::fs::copy(&plain.files.weights[0], &scaled.files.weights[0]).unwrap();

    let ids = Tensor::new(&[[3u32, 4, 5, 3]], &Device::Cpu).unwrap();
    let a = build_model(&plain).forward(&ids).unwrap();
    let b = build_model(&scaled).forward(&ids).unwrap();
    assert!(max_abs_diff(&a.i((0, 3)).unwrap(), &b.i((0, 3)).unwrap()) > 1e-6);
    // The first position has angle zero either way.
    assert!(max_abs_diff(&a.i((0, 0)).unwrap(), &b.i((0, 0)).unwrap()) < 1e-5);
}

#[test]
fn unsupported_rope_scaling_fails_to_load() {
    let checkpoint = TinyCheckpoint::with_config(json!({
        "rope_scaling": {"rope_type": "yarn", "factor": 4.0}
    }));
    let err = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap_err();
    assert!(format!("{err:#}").contains("yarn"), "{err:#}");
}

#[test]
fn generator_is_reproducible_with_a_seed() {
    let checkpoint = TinyCheckpoint::new();
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();

    let a = generator.generate(&params("hello again", 10, 5)).unwrap();
    let b = generator.generate(&params("hello again", 10, 5)).unwrap();
    assert_eq!(a, b);
}

#[test]
fn max_length_below_prompt_still_answers() {
    let checkpoint = TinyCheckpoint::new();
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();

    let text = generator
        .generate(&params("hello world hello world again", 2, 3))
        .unwrap();
    assert!(text.starts_with("hello world hello world again"), "{text}");
    assert!(text.split_whitespace().count() <= 6, "{text}");
}

#[test]
fn zero_temperature_fails() {
    let checkpoint = TinyCheckpoint::new();
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();

    let mut request = params("hello", 5, 1);
    request.temperature = 0.0;
    let err = generator.generate(&request).unwrap_err();
    assert!(err.to_string().contains("temperature"));
}

#[tokio::test]
async fn serves_generation_from_a_real_model() {
    let checkpoint = TinyCheckpoint::new();
    let generator = loader::load_generator(&checkpoint.files, &Device::Cpu).unwrap();
    let state = AppState::new(Box::new(generator), "tiny-llama", DeviceKind::Cpu, false);
    let app = create_router(Arc::new(state));

    let response = app
        .clone()
        .oneshot(json_request("POST", "/generate", json!({"prompt": "hello world"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["generated_text"]
        .as_str()
        .unwrap()
        .starts_with("hello world"));
    assert_eq!(body["model"], "tiny-llama");
    assert_eq!(body["device"], "cpu");
    assert!(body["generation_time"].as_f64().unwrap() > 0.0);

    let response = app
        .oneshot(json_request(
            "POST",
            "/generate",
            json!({"prompt": "hello", "temperature": -1.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["detail"].as_str().unwrap().contains("temperature"));
}
