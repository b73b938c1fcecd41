//! shyLLM Server - serves a text-generation model on a free port

use shyllm_core::{HubLoader, PipelineCache};
use shyllm_server::bootstrap::{self, Conclusion};
use shyllm_server::{logging, reload, AppState, PortFinder, ServerConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<ExitCode> {
    logging::init();

    let config = ServerConfig::from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;
    let conclusion = runtime.block_on(serve(config))?;
    // Worker threads and the listener are gone before the process is replaced.
    // A generation still running on a blocking thread is abandoned.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);

    match conclusion {
        Conclusion::Exit(code) => Ok(ExitCode::from(code)),
        Conclusion::Reload => reload::relaunch(),
    }
}

async fn serve(config: ServerConfig) -> anyhow::Result<Conclusion> {
    info!("Selected model: {}", config.model_name);
    if config.api_key.is_none() {
        info!("No API key configured, requests without a key are accepted");
    }

    // The model itself is loaded on the first generation request.
    let loader = HubLoader::new(config.revision.clone())?;
    let state = AppState::new(
        PipelineCache::new(Arc::new(loader)),
        config.model_name.clone(),
        config.api_key.clone(),
    );
    let app = shyllm_server::router(state);

    let mut ports = PortFinder::new();
    let outcome = bootstrap::run_server(
        app,
        &mut ports,
        &config.serve_options(),
        bootstrap::shutdown_signal(),
    )
    .await;

    bootstrap::conclude(outcome)
}
