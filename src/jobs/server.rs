use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};
use super::{JobManager, OrchestratorLauncher};

/// Configuration for the job server.
pub struct ServerConfig {
    pub port: u16,
    /// Where job records and event logs live.
    pub jobs_dir: PathBuf,
    /// Heartbeat for jobs whose project config cannot be read.
    pub heartbeat: Duration,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3141,
            jobs_dir: PathBuf::from(".forgeline/jobs"),
            heartbeat: Duration::from_secs(15),
            dev_mode: false,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router().with_state(state)
}

/// Start the job server and serve until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    std::fs::create_dir_all(&config.jobs_dir)
        .with_context(|| format!("Failed to create jobs dir: {}", config.jobs_dir.display()))?;

    let jobs = Arc::new(JobManager::new(
        &config.jobs_dir,
        Arc::new(OrchestratorLauncher),
        config.heartbeat,
    ));
    jobs.load_existing()?;

    let mut app = build_router(Arc::new(AppState { jobs }));
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "Job server listening");
    println!("forgeline job server running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
