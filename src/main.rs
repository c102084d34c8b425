use std::sync::Arc;

use anyhow::{Context, Error};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use textgen_serve::api::create_router;
use textgen_serve::config::ServiceConfig;
use textgen_serve::llm::{device, loader, DeviceKind};
use textgen_serve::AppState;

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("textgen_serve=info,tower_http=info")
        }))
        .init();

    if let Err(err) = run().await {
        tracing::error!("startup failed: {err:#}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> Result<(), Error> {
    let config = ServiceConfig::from_env()?;

    let device = device::select_device().context("failed to select compute device")?;
    let device_kind = DeviceKind::of(&device);
    let cuda_available = device::cuda_available();

    tracing::info!("Loading model {} on {}...", config.model_name, device_kind);

    // The hub client and weight mapping are blocking.
    let model_name = config.model_name.clone();
    let generator = tokio::task::spawn_blocking(move || {
        let files = loader::fetch_model_files(&model_name)?;
        loader::load_generator(&files, &device)
    })
    .await
    .context("model loading task panicked")??;

    tracing::info!(model = %config.model_name, device = %device_kind, "model loaded");

    let state = Arc::new(AppState::new(
        Box::new(generator),
        config.model_name.clone(),
        device_kind,
        cuda_available,
    ));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
