use axum::{extract::rejection::JsonRejection, extract::State, Json};
use std::sync::Arc;
use std::time::Instant;

use crate::api::error::ApiError;
use crate::api::models::{GenerationRequest, GenerationResponse, HealthResponse, InfoResponse};
use crate::app_state::AppState;
use crate::llm::GenerationParams;

pub async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        status: "healthy",
        model: state.model_name.clone(),
        device: state.device,
        cuda_available: state.cuda_available,
    })
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Json<GenerationResponse>, ApiError> {
    let start = Instant::now();
    let Json(request) = payload?;

    tracing::info!(
        prompt_chars = request.prompt.len(),
        max_length = request.max_length,
        temperature = request.temperature,
        "generation request"
    );

    let params = GenerationParams::from(request);
    let worker_state = Arc::clone(&state);
    // Generation is blocking and the model is shared, keep it off the async workers.
    let result = tokio::task::spawn_blocking(move || {
        let generator = worker_state.generator();
        generator.generate(&params)
    })
    .await
    .map_err(ApiError::from)
    .and_then(|generated| generated.map_err(ApiError::from));

    let generated_text = match result {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "generation failed");
            return Err(err);
        }
    };

    let generation_time = start.elapsed().as_secs_f64();
    tracing::info!(generation_time, "generation finished");

    Ok(Json(GenerationResponse {
        generated_text,
        model: state.model_name.clone(),
        device: state.device.to_string(),
        generation_time,
    }))
}
