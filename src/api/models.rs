use serde::{Deserialize, Serialize};

use crate::llm::{DeviceKind, GenerationParams};

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_length() -> usize {
    100
}

fn default_temperature() -> f64 {
    0.7
}

impl From<GenerationRequest> for GenerationParams {
    fn from(request: GenerationRequest) -> Self {
        GenerationParams {
            prompt: request.prompt,
            max_length: request.max_length,
            temperature: request.temperature,
            seed: request.seed,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub generated_text: String,
    pub model: String,
    pub device: String,
    /// Wall-clock seconds spent on the request.
    pub generation_time: f64,
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub status: &'static str,
    pub model: String,
    pub device: DeviceKind,
    pub cuda_available: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
