use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use candle_core::safetensors::MmapedSafetensors;
use candle_core::Device;
use hf_hub::api::sync::{Api, ApiRepo};
use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::config::ModelConfig;
use crate::llm::device::DeviceKind;
use crate::llm::generator::CandleGenerator;
use crate::llm::models::LlamaModel;

const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";
const SHARD_INDEX_FILE: &str = "model.safetensors.index.json";

/// Local paths of everything needed to build a model.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Distinct shard file names referenced by a `model.safetensors.index.json`.
pub fn parse_shard_index(raw: &str) -> Result<Vec<String>, Error> {
    let index: ShardIndex = serde_json::from_str(raw).context("malformed shard index")?;
    let files: BTreeSet<String> = index.weight_map.into_values().collect();
    if files.is_empty() {
        bail!("shard index lists no weight files");
    }
    Ok(files.into_iter().collect())
}

/// Downloads (or reuses the hub cache for) the files of `model_name`.
pub fn fetch_model_files(model_name: &str) -> Result<ModelFiles, Error> {
    let api = Api::new().context("failed to initialise the Hugging Face hub client")?;
    let repo = api.model(model_name.to_string());

    let config = repo
        .get("config.json")
        .with_context(|| format!("{model_name}: config.json not found"))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .with_context(|| format!("{model_name}: tokenizer.json not found"))?;
    let weights = fetch_weights(&repo, model_name)?;

    Ok(ModelFiles {
        config,
        tokenizer,
        weights,
    })
}

fn fetch_weights(repo: &ApiRepo, model_name: &str) -> Result<Vec<PathBuf>, Error> {
    if let Ok(path) = repo.get(SINGLE_WEIGHTS_FILE) {
        return Ok(vec![path]);
    }

    let index_path = repo.get(SHARD_INDEX_FILE).with_context(|| {
        format!("{model_name}: neither {SINGLE_WEIGHTS_FILE} nor {SHARD_INDEX_FILE} found")
    })?;
    let raw = std::fs::read_to_string(&index_path)
        .with_context(|| format!("failed to read {}", index_path.display()))?;

    parse_shard_index(&raw)?
        .iter()
        .map(|file| {
            repo.get(file)
                .with_context(|| format!("{model_name}: shard {file} not found"))
        })
        .collect()
}

pub fn load_model_config(path: &Path) -> Result<ModelConfig, Error> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let cfg: ModelConfig = serde_json::from_reader(file)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    if cfg.model_type != "llama" {
        bail!("unsupported model_type {:?}, only llama checkpoints can be served", cfg.model_type);
    }
    Ok(cfg)
}

pub fn load_tokenizer(path: &Path) -> Result<Tokenizer, Error> {
    Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))
}

fn load_weights_mmap(paths: &[PathBuf]) -> Result<MmapedSafetensors, Error> {
    // Safety: the files stay untouched in the hub cache for the process lifetime.
    let weights = unsafe { MmapedSafetensors::multi(paths)? };
    Ok(weights)
}

/// Builds the generator from already-resolved files, at the precision
/// matching `device`.
pub fn load_generator(files: &ModelFiles, device: &Device) -> Result<CandleGenerator, Error> {
    let cfg = load_model_config(&files.config)?;
    let tokenizer = load_tokenizer(&files.tokenizer)?;
    let weights = load_weights_mmap(&files.weights).context("failed to map model weights")?;

    let dtype = DeviceKind::of(device).dtype();
    tracing::info!(
        layers = cfg.num_hidden_layers,
        hidden_size = cfg.hidden_size,
        shards = files.weights.len(),
        ?dtype,
        "building model"
    );

    let model = LlamaModel::new(&weights, &cfg, device, dtype).context("failed to build model")?;

    let mut stop_token_ids = cfg.stop_token_ids();
    if stop_token_ids.is_empty() {
        stop_token_ids.extend(tokenizer.token_to_id("</s>"));
    }
    tracing::debug!(?stop_token_ids, "stop tokens");

    Ok(CandleGenerator::new(
        Box::new(model),
        tokenizer,
        stop_token_ids,
        cfg.max_position_embeddings,
    ))
}
