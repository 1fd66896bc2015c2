mod compiler;
mod config;
mod core;
mod encoder;
mod handler;
mod routes;
mod runner;
mod workspace;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::handler::CompileService;
use crate::routes::{body_limit, create_router, AppState};
use crate::runner::ProcessRunner;

#[tokio::main]
async fn main() -> Result<()> {
    // Loaded first so RUST_LOG from .env reaches the filter
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("zxbasic_compiler=info".parse()?),
        )
        .init();

    let config = ServiceConfig::from_env()?;
    let profile = config.load_profile()?;
    info!(
        "Loaded compiler profile: program={}, source_file={}, artifact_file={}",
        profile.program, profile.source_file, profile.artifact_file
    );

    let service = CompileService::new(&config, profile, Arc::new(ProcessRunner::new()))
        .with_context(|| {
            format!(
                "Failed to prepare workspace root {}",
                config.workspace_root.display()
            )
        })?;
    info!(
        "Compile service ready: workspace_root={}, timeout_ms={}, max_concurrent={}",
        config.workspace_root.display(),
        config.compile_timeout.as_millis(),
        config.max_concurrent_compiles
    );

    let state = Arc::new(AppState { service });
    let app = create_router(state, body_limit(config.max_source_bytes));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining in-flight requests");
}
