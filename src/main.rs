//! Crawler daemon binary entrypoint.
//! `once` runs every source a single time; `start` keeps them on their own
//! timers and serves the status API until Ctrl-C.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crawl_daemon::api::{self, AppState};
use crawl_daemon::cli::{Cli, Command};
use crawl_daemon::config::{load_config_default, load_config_from, DaemonConfig};
use crawl_daemon::metrics::Metrics;
use crawl_daemon::registry;
use crawl_daemon::sink::DEFAULT_PUSH_TIMEOUT;

/// `RUST_LOG` wins over the default filter; `LOG_FORMAT=json` switches to
/// structured output.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("crawl_daemon=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact())
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<DaemonConfig> {
    match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config_default(),
    }
}

async fn run_once(cfg: &DaemonConfig) -> Result<()> {
    let orch = registry::build(cfg, registry::http_client()?)?;
    if orch.is_empty() {
        tracing::warn!("no sources configured");
    }
    let summary = orch.run_all_once().await;
    // Fetch failures are logged, not turned into an exit code.
    if !summary.failed.is_empty() {
        tracing::warn!(failed = ?summary.failed, "some sources failed");
    }
    if !summary.skipped.is_empty() {
        tracing::info!(skipped = ?summary.skipped, "some sources skipped");
    }
    // the runtime is dropped when main returns; let pending pushes settle first
    orch.sink().flush(DEFAULT_PUSH_TIMEOUT).await;
    Ok(())
}

async fn run_daemon(cfg: &DaemonConfig) -> Result<()> {
    let metrics = Metrics::init()?;
    let orch = Arc::new(registry::build(cfg, registry::http_client()?)?);

    let app = api::router(AppState::new(Arc::clone(&orch))).merge(metrics.router());
    let listener = tokio::net::TcpListener::bind(&cfg.api_bind)
        .await
        .with_context(|| format!("binding status api on {}", cfg.api_bind))?;
    tracing::info!(addr = %cfg.api_bind, "status api listening");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "status api stopped");
        }
    });

    orch.start_all().await;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    orch.shutdown(DEFAULT_PUSH_TIMEOUT).await;
    server.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(&cli)?;

    match cli.command() {
        Command::Once => run_once(&cfg).await,
        Command::Start => run_daemon(&cfg).await,
    }
}
