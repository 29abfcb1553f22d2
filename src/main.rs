//! Usage monitor daemon.
//!
//! Polls translation API usage endpoints for groups of keys, each group
//! on its own cadence, and keeps the observed usage history in SQLite.
//! Managed over a local JSON-RPC socket.

mod adapters;
mod config;
mod poller;
mod scheduler;
mod server;
mod store;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use adapters::deepl::DeepLProbe;
use adapters::UsageProbe;
use config::Config;
use poller::GroupPoller;
use scheduler::CadenceScheduler;
use server::{AppState, Server};
use store::Store;

/// Upper bound on waiting for running polls at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "usage_monitor=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).with_target(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_json);

    info!("Usage monitor v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;

    // ── Store ───────────────────────────────────────────────────────
    let store = Arc::new(Store::open(&config.db_path())?);
    info!(db = %config.db_path().display(), "Store opened");

    // ── Probe ───────────────────────────────────────────────────────
    let probe: Arc<dyn UsageProbe> = Arc::new(DeepLProbe::new(
        &config.free_base_url,
        &config.pro_base_url,
        config.request_timeout(),
    )?);
    info!(
        provider = probe.provider_id(),
        timeout_secs = config.request_timeout_secs,
        "Usage probe ready"
    );

    // ── Scheduler ───────────────────────────────────────────────────
    let poller = Arc::new(GroupPoller::new(Arc::clone(&store), probe, config.probe_pause()));
    let scheduler = Arc::new(CadenceScheduler::new(
        Arc::clone(&store),
        poller,
        config.max_concurrent_groups,
    ));
    scheduler.seed(config.default_interval_secs)?;

    // ── Server ──────────────────────────────────────────────────────
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        scheduler: Arc::clone(&scheduler),
        default_interval_secs: config.default_interval_secs,
    });
    let server = Server::new(config.socket_path(), state);

    let outcome = tokio::select! {
        res = server.run() => res,
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            Ok(())
        }
    };

    scheduler.shutdown();
    if !scheduler.wait_idle(SHUTDOWN_GRACE).await {
        warn!("Exiting with polls still in flight");
    }

    let _ = std::fs::remove_file(config.socket_path());
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
