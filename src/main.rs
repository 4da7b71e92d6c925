mod auth;
mod backend;
mod config;
mod error;
mod git;
mod health;
mod http;
mod metrics;
mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::auth::Authenticator;
use crate::backend::{Backend, LocalBackend};
use crate::config::Config;
use crate::git::{Executor, GitExecutor};
use crate::metrics::{MetricsRegistry, Recorder};
use crate::ssh::{ActiveSessions, GitDispatch, LoggingMiddleware, Pipeline, UnsupportedCommand};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "SSH Git Gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all SSH sessions and HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: MetricsRegistry,
    pub authenticator: Arc<Authenticator>,
    /// Middleware chain every exec and shell request runs through.
    pub pipeline: Pipeline,
    pub sessions: ActiveSessions,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState, listen_addr: String) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state));

    let listen_addr: std::net::SocketAddr = listen_addr
        .parse()
        .with_context(|| format!("invalid http listen address: {listen_addr:?}"))?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn run_ssh_server(state: AppState) -> Result<()> {
    crate::ssh::start_ssh_server(Arc::new(state), shutdown_signal()).await
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Ensure the repository root exists ----
    let repos_dir = config.repos_dir();
    tokio::fs::create_dir_all(&repos_dir)
        .await
        .with_context(|| format!("failed to create repository dir: {}", repos_dir.display()))?;

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();
    let recorder: Arc<dyn Recorder> = metrics.metrics.clone();

    // ---- Backend ----
    let local = LocalBackend::from_config(&config.backend, &repos_dir)?;
    local.discover().await?;
    let backend: Arc<dyn Backend> = Arc::new(local);

    // ---- Authentication ----
    let admin_keys = config.admin_keys()?;
    tracing::info!(count = admin_keys.len(), "bootstrap administrator keys loaded");
    let authenticator = Arc::new(Authenticator::new(
        admin_keys.iter().cloned(),
        Arc::clone(&backend),
        Arc::clone(&recorder),
    ));

    // ---- Command pipeline ----
    let executor: Arc<dyn Executor> = Arc::new(GitExecutor);
    let pipeline = Pipeline::new(vec![
        Arc::new(LoggingMiddleware),
        Arc::new(
            GitDispatch::new(&repos_dir, backend, executor, recorder).with_admin_keys(admin_keys),
        ),
        Arc::new(UnsupportedCommand),
    ]);

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        sessions: ActiveSessions::new(metrics.metrics.active_sessions.clone()),
        metrics,
        authenticator,
        pipeline,
    };

    // ---- Spawn services ----
    let http_handle = tokio::spawn({
        let s = state.clone();
        let http = config.http.clone();
        async move {
            let Some(http) = http else {
                return;
            };
            if let Err(e) = run_http_server(s, http.listen_addr).await {
                tracing::error!(error = %e, "HTTP server failed");
            }
        }
    });

    let ssh_handle = tokio::spawn({
        let s = state.clone();
        async move {
            if let Err(e) = run_ssh_server(s).await {
                tracing::error!(error = %e, "SSH server failed");
            }
        }
    });

    // ---- Await shutdown ----
    // Each server watches its own `shutdown_signal()` and winds down.
    let _ = tokio::try_join!(http_handle, ssh_handle);

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
