// =============================================================================
// Foresight Signal Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo mode for safety: analyst dispatch runs against
// the deterministic demo backend until an operator explicitly switches the
// engine to Live via the config API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysts;
mod api;
mod app_state;
mod consensus;
mod crawler;
mod dispatch;
mod error;
mod evaluation;
mod extractor;
mod learning;
mod llm;
mod model;
mod outcome;
mod promotion;
mod review_queue;
mod runtime_config;
mod scheduler;
mod store;
mod symbols;
mod testdata;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;
use crate::types::EngineMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Foresight Signal Nexus — Starting Up             ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo mode on startup.
    config.engine_mode = EngineMode::Demo;

    info!(
        engine_mode = %config.engine_mode,
        predictor_ttl_hours = config.predictor_ttl_hours,
        resolution_horizon_hours = config.resolution_horizon_hours,
        "Engine starting in SAFE mode (Demo)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Spawn pipeline workers ────────────────────────────────────────
    scheduler::spawn_workers(state.clone());
    info!("Pipeline workers launched");

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("FORESIGHT_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Foresight Signal Nexus shut down complete.");
    Ok(())
}
