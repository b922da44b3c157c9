//! ==============================================================================
//! main.rs - climate host entry point
//! ==============================================================================
//!
//! purpose:
//!     wires the configuration, history log, sources, poller and web server
//!     together and keeps them running.
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust host (this file)                     │
//!     │  ┌─────────────────────┐        ┌───────────────────────┐   │
//!     │  │ poller task         │        │ web server            │   │
//!     │  │ (interval cycle)    │        │ (reads snapshots)     │   │
//!     │  └──────┬──────────────┘        └───────────┬───────────┘   │
//!     │         │ append + publish                   │ current()     │
//!     │   ┌─────┴──────┐   ┌───────────────┐         │              │
//!     │   │ history    │   │ watch channel ├─────────┘              │
//!     │   │ (jsonl)    │   │ (Snapshot)    │                        │
//!     │   └────────────┘   └───────────────┘                        │
//!     └─────────────────────────────────────────────────────────────┘
//!              │ read(timeout)
//!     ┌────────┴─────────┬──────────────────┐
//!     ▼                  ▼                  ▼
//!  ble sensor ...    ble sensor      openweathermap
//!
//! start-up failures:
//!     an invalid config or an unreadable history file stops the host.
//!     a damaged history file does not; bad records are skipped.
//!
//! ==============================================================================

use climate_host::config::{self, HostConfig};
use climate_host::health::HealthTracker;
use climate_host::history::HistoryStore;
use climate_host::poller::{Poller, PollerSettings};
use climate_host::publisher::{self, Snapshot};
use climate_host::server::{self, ServerState};
use climate_host::source;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Climate Host");
    println!("  BLE thermometers + weather reference");
    println!("===========================================================");

    // step 1: load configuration (a .env file may carry the api key)
    dotenvy::dotenv().ok();
    let config = HostConfig::load_or_default()
        .context("loading configuration")?
        .with_env_api_key(std::env::var(config::API_KEY_ENV).ok());

    init_logging(&config.logging.level);
    config.validate().context("validating configuration")?;
    config.print_summary();

    // step 2: rebuild history from disk
    let (store, report) = HistoryStore::open(&config.storage.path)
        .with_context(|| format!("opening history {}", config.storage.path.display()))?;
    if !report.skipped.is_empty() {
        tracing::warn!("[STARTUP] {} damaged history record(s) skipped", report.skipped.len());
    }
    tracing::info!("[STARTUP] ✓ History ready ({} rows)", store.len());

    // step 3: shared state
    let (publisher, reader) = publisher::channel(Snapshot::from_history(store.view()));
    let health = HealthTracker::new();

    // step 4: sources
    let sources = source::build_sources(&config).context("building sources")?;
    tracing::info!("[STARTUP] ✓ {} sources configured", sources.len());

    // step 5: web server in background
    let server_state = ServerState {
        reader,
        health: health.clone(),
        refresh_seconds: config.polling.interval().as_secs() + 5,
    };
    let bind = config.server.bind.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = server::run_server(&bind, server_state).await {
            tracing::error!("[ERROR] Web server error: {:#}", e);
        }
    });

    // step 6: poller
    let poller = Poller::new(sources, store, publisher, health, PollerSettings::from(&config));
    let polling = tokio::spawn(poller.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[SHUTDOWN] Ctrl-C received");
        }
        _ = server => {
            tracing::error!("[SHUTDOWN] Web server stopped");
        }
        _ = polling => {
            tracing::error!("[SHUTDOWN] Poller stopped");
        }
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
