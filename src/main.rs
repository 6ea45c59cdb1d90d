use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ess_pilot::battery::client::TcpConnector;
use ess_pilot::config::{self, Config};
use ess_pilot::Plant;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config::DEFAULT_PATH.to_owned());
    let cfg = Config::load(&path).with_context(|| format!("loading {}", path))?;

    let connector = Arc::new(TcpConnector::new(cfg.modbus.io_timeout()));
    let plant = Plant::from_config(&cfg, connector)?;
    let sweep = plant
        .coordinator
        .spawn_sweep(Duration::from_millis(cfg.pilot.sweep_interval_ms));

    info!(
        devices = cfg.devices.len(),
        primary = ?cfg.primary_device().map(|d| d.name.as_str()),
        "ess_pilot started"
    );

    tokio::select! {
        _ = plant.scheduler.clone().run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    sweep.abort();
    Ok(())
}
