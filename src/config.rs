use std::net::SocketAddr;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_MODEL_NAME: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid BIND_ADDR {value:?}: {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
}

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub model_name: String,
    pub bind_addr: SocketAddr,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let model_name = lookup("MODEL_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string());

        let raw_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = raw_addr
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: raw_addr.clone(),
                source,
            })?;

        Ok(Self {
            model_name,
            bind_addr,
        })
    }
}

/// The parts of a checkpoint's `config.json` the Llama decoder needs.
#[derive(Deserialize, Debug, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(rename = "hidden_act", default = "default_hidden_act")]
    pub hidden_activation: String,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    pub vocab_size: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    pub eos_token_id: Option<EosTokenId>,
    pub rope_scaling: Option<RopeScaling>,
}

/// `eos_token_id` is a single id in older checkpoints and a list in
/// chat-tuned Llama 3 ones.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn ids(&self) -> Vec<u32> {
        match self {
            EosTokenId::Single(id) => vec![*id],
            EosTokenId::Multiple(ids) => ids.clone(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RopeScaling {
    pub rope_type: Option<String>,
    /// Older checkpoints spell `rope_type` as `type`.
    #[serde(rename = "type")]
    pub legacy_type: Option<String>,
    #[serde(default = "default_rope_factor")]
    pub factor: f32,
    pub low_freq_factor: Option<f32>,
    pub high_freq_factor: Option<f32>,
    pub original_max_position_embeddings: Option<usize>,
}

impl RopeScaling {
    pub fn kind(&self) -> &str {
        self.rope_type
            .as_deref()
            .or(self.legacy_type.as_deref())
            .unwrap_or("default")
    }
}

fn default_rope_factor() -> f32 {
    1.0
}

impl ModelConfig {
    /// Token ids that end generation.
    pub fn stop_token_ids(&self) -> Vec<u32> {
        self.eos_token_id
            .as_ref()
            .map(EosTokenId::ids)
            .unwrap_or_default()
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

fn default_model_type() -> String {
    "llama".to_string()
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_max_position_embeddings() -> usize {
    2048
}
