//! Power setpoint dispatch and telemetry for Modbus TCP battery units.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::warn;

pub mod battery;
pub mod config;
pub mod pilot;
pub mod poll;

use crate::battery::catalog;
use crate::battery::client::{Connector, ConnectionManager};
use crate::battery::RegisterItem;
use crate::config::Config;
use crate::pilot::soc::{SocConstraintEngine, SocConstraintResult};
use crate::pilot::{PilotDispatcher, PilotError, PilotTarget, TransactionCoordinator};
use crate::poll::{PollError, PollScheduler, SharedSnapshot, Snapshot};

/// Everything wired up for one configuration.
pub struct Plant {
    managers: HashMap<String, Arc<ConnectionManager>>,
    items: HashMap<String, RegisterItem>,
    pub scheduler: Arc<PollScheduler>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub soc: Arc<SocConstraintEngine>,
    pub pilot: PilotDispatcher,
}

impl Plant {
    pub fn from_config(cfg: &Config, connector: Arc<dyn Connector>) -> Result<Self, PilotError> {
        let snapshot: SharedSnapshot = Arc::new(RwLock::new(Snapshot::new()));
        let options = cfg.modbus.client_options();
        let mut coordinator = TransactionCoordinator::new(
            snapshot.clone(),
            Duration::from_millis(cfg.pilot.transaction_timeout_ms),
            cfg.pilot.power_factor_scale,
        );

        let mut managers = Vec::new();
        let mut items = Vec::new();
        let mut discharge_limits = Vec::new();
        for dev in &cfg.devices {
            let manager = Arc::new(ConnectionManager::new(
                &dev.name,
                dev.host.clone(),
                dev.port,
                connector.clone(),
                options.clone(),
            ));
            items.extend(catalog::battery_items(dev));
            discharge_limits.push((manager.clone(), catalog::max_discharge_item(dev)));
            coordinator.add_target(PilotTarget::new(
                manager.clone(),
                catalog::pilot_power_item(dev),
                catalog::pilot_power_factor_item(dev),
            )?);
            managers.push(manager);
        }
        items.extend(cfg.extra_items.iter().cloned());

        let oracle: HashMap<String, bool> = cfg
            .disabled_items
            .iter()
            .map(|key| (key.clone(), false))
            .collect();

        let mut scheduler = PollScheduler::new(
            managers.clone(),
            items.clone(),
            Arc::new(oracle),
            snapshot.clone(),
        )
        .with_intervals(
            Duration::from_secs(cfg.poll.primary_interval_secs),
            Duration::from_secs(cfg.poll.secondary_interval_secs),
        );
        let primary = cfg
            .primary_device()
            .map(|d| d.name.clone())
            .unwrap_or_default();
        scheduler = scheduler.with_primary(primary.clone());

        let soc = Arc::new(SocConstraintEngine::new(cfg.soc, snapshot, discharge_limits));
        let coordinator = Arc::new(coordinator.with_soc_constraint(soc.clone()));
        let pilot = PilotDispatcher::new(primary, soc.clone(), coordinator.clone());

        Ok(Self {
            managers: managers
                .into_iter()
                .map(|m| (m.device().to_owned(), m))
                .collect(),
            items: items.into_iter().map(|i| (i.name.clone(), i)).collect(),
            scheduler: Arc::new(scheduler),
            coordinator,
            soc,
            pilot,
        })
    }

    pub fn manager(&self, device: &str) -> Option<&Arc<ConnectionManager>> {
        self.managers.get(device)
    }

    fn lookup(&self, key: &str) -> Option<(&RegisterItem, &Arc<ConnectionManager>)> {
        let item = self.items.get(key)?;
        let manager = self.managers.get(&item.device)?;
        Some((item, manager))
    }

    pub async fn read(&self, key: &str) -> Option<f64> {
        let Some((item, manager)) = self.lookup(key) else {
            warn!(item = key, "unknown item");
            return None;
        };
        manager.read(item).await
    }

    /// Pilot registers are only ever written as a pair, so their halves
    /// go through the coordinator.
    pub async fn write(&self, key: &str, value: f64) -> bool {
        if let Some(result) = self.coordinator.write_item(key, value).await {
            return result.is_ok();
        }
        let Some((item, manager)) = self.lookup(key) else {
            warn!(item = key, "unknown item");
            return false;
        };
        manager.write(value, item).await
    }

    pub async fn poll_once(&self) -> Result<Snapshot, PollError> {
        self.scheduler.poll_once().await
    }

    pub async fn write_pilot_power(&self, power: f64, power_factor: f64) -> bool {
        self.pilot.write_pilot_power(power, power_factor).await
    }

    pub async fn check_soc_constraint(&self, power: f64) -> SocConstraintResult {
        self.pilot.check_soc_constraint(power).await
    }
}
