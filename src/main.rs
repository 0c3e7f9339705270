//! provision-ble - BLE daemon for headless WiFi provisioning.
//!
//! Exposes a small GATT service over BLE so a phone or browser can
//! configure WiFi credentials on a device with no keyboard, display, or
//! wired network.

mod ble;
mod command;
mod config;
mod dispatcher;
mod ipmon;
mod provision;
mod wifi;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ble::GattServer;
use config::Config;
use dispatcher::Dispatcher;
use provision::{state_payload, ProvisionState};
use wifi::NmcliWifiManager;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_logging(&config.log_file);

    info!("provision-ble starting");

    if let Err(e) = run(config).await {
        error!("Fatal error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ble::BleError> {
    // Every event source posts into this channel; the dispatcher drains it.
    let (event_tx, event_rx) = mpsc::channel(32);

    ipmon::spawn(config.wifi_ifname.clone(), event_tx.clone());

    let wifi = Arc::new(NmcliWifiManager::new(config.wifi_ifname.clone()));

    // Cached State value, served on reads before and between notifications.
    let state_value = Arc::new(RwLock::new(state_payload(ProvisionState::Unconfigured)));

    let server = GattServer::new(config.alias, event_tx, Arc::clone(&state_value));
    let _handles = server.start().await?;

    info!("Entering event loop");
    Dispatcher::new(wifi, state_value).run(event_rx).await;

    Ok(())
}

/// Log to the configured file (append mode), or stderr if it cannot be
/// opened. Level filtering follows `RUST_LOG` with an info default for
/// this crate.
fn init_logging(path: &Path) {
    let filter = EnvFilter::from_default_env()
        .add_directive("provision_ble=info".parse().unwrap());

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            tracing::warn!(
                "could not open log file {}: {}; logging to stderr",
                path.display(),
                e
            );
        }
    }
}
