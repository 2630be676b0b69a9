//! PotatEval: sandboxed code evaluation service.
//!
//! Accepts untrusted snippets over an authenticated HTTP endpoint and runs
//! each one in an isolated V8 guest with hard memory, wall-clock, and
//! outbound-network limits.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use potat_config::ServiceConfig;
use potat_sandbox::{AdmissionQueue, IsolateRunner, RunnerConfig};
use potat_server::{router, AppState};
use tracing_subscriber::EnvFilter;

/// Locate the config file.
///
/// Search order:
/// 1. `POTAT_CONFIG` environment variable
/// 2. `./config.json` in the current directory
fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("POTAT_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("config.json");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let path = find_config_file()
        .context("no config file found (set POTAT_CONFIG or create ./config.json)")?;
    tracing::info!(path = %path.display(), "loading config");
    let config = ServiceConfig::from_file(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;

    let runner_config = RunnerConfig {
        max_fetch_concurrency: config.max_fetch_concurrency,
        ..RunnerConfig::default()
    };
    let runner =
        Arc::new(IsolateRunner::new(runner_config).context("failed to build isolate runner")?);
    let queue = AdmissionQueue::new(runner);

    let state = AppState {
        queue,
        auth_secret: Arc::new(config.auth.clone()),
    };

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(
        %addr,
        max_fetch_concurrency = config.max_fetch_concurrency,
        "starting eval server"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, router(state))
        .await
        .context("server exited")?;

    Ok(())
}
