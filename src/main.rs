/* ikeysd: host-side daemon for IntelliKeys overlay keyboards.
 *
 * Watches udev for IntelliKeys devices, bootstraps firmware on the ones that
 * need it, runs one protocol actor per running device and exposes each on
 * the system bus under org.freedesktop.intellikeys1. */

mod actor;
mod config;
mod dbus;
mod device;
mod dispatcher;
mod eeprom;
mod engine;
mod error;
mod firmware;
mod interpreter;
mod modifier;
mod overlay;
mod overlay_database;
mod protocol;
mod queue;
mod report;
mod settings;
mod settle;
mod transport;
mod udev_monitor;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::settings::SettingsStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ikeysd=info")),
        )
        .init();

    info!("ikeysd {} starting", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load().context("Loading daemon configuration")?;

    let overlays = Arc::new(overlay_database::load_overlay_directory(&config.overlay_dir));
    info!(
        "{} overlays available from {}",
        overlays.len(),
        config.overlay_dir.display()
    );

    let settings = Arc::new(SettingsStore::open(&config.settings_file));

    let device_rx = udev_monitor::spawn_monitor();

    dbus::run_server(
        device_rx,
        dbus::ServerContext {
            config,
            overlays,
            settings,
        },
    )
    .await
}
