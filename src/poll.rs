//! Periodic telemetry snapshot across all battery units.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::battery::client::ConnectionManager;
use crate::battery::{Measure, RegisterItem};

pub const COMBINED_SOC: &str = "combined_soc";
pub const COMBINED_POWER: &str = "combined_power";
pub const CUMULATIVE_ENERGY_PRODUCED: &str = "cumulative_energy_produced";
pub const CUMULATIVE_ENERGY_CONSUMED: &str = "cumulative_energy_consumed";

/// Item key to value; `None` for a failed read.
pub type Snapshot = BTreeMap<String, Option<f64>>;
pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("forced reconnect of {device} failed")]
    ReconnectFailed { device: String },
}

/// Host-side entity enablement.
pub trait EnablementOracle: Send + Sync {
    /// `None` if the host has never seen `key`.
    fn is_enabled(&self, key: &str) -> Option<bool>;
}

impl EnablementOracle for HashMap<String, bool> {
    fn is_enabled(&self, key: &str) -> Option<bool> {
        self.get(key).copied()
    }
}

pub struct PollScheduler {
    devices: HashMap<String, Arc<ConnectionManager>>,
    items: Vec<RegisterItem>,
    oracle: Arc<dyn EnablementOracle>,
    latest: SharedSnapshot,
    primary: Option<String>,
    primary_interval: Duration,
    secondary_interval: Duration,
}

impl PollScheduler {
    pub fn new(
        devices: Vec<Arc<ConnectionManager>>,
        items: Vec<RegisterItem>,
        oracle: Arc<dyn EnablementOracle>,
        latest: SharedSnapshot,
    ) -> Self {
        Self {
            devices: devices
                .into_iter()
                .map(|m| (m.device().to_owned(), m))
                .collect(),
            items,
            oracle,
            latest,
            primary: None,
            primary_interval: Duration::from_secs(10),
            secondary_interval: Duration::from_secs(30),
        }
    }

    pub fn with_primary(mut self, device: impl Into<String>) -> Self {
        self.primary = Some(device.into());
        self
    }

    pub fn with_intervals(mut self, primary: Duration, secondary: Duration) -> Self {
        self.primary_interval = primary;
        self.secondary_interval = secondary;
        self
    }

    pub fn latest(&self) -> SharedSnapshot {
        self.latest.clone()
    }

    /// Poll every device once and publish the snapshot.
    pub async fn poll_once(&self) -> Result<Snapshot, PollError> {
        let all: HashSet<String> = self.devices.keys().cloned().collect();
        self.poll_due(&all).await
    }

    /// Poll the devices in `due`; items of other devices keep their last
    /// published value.
    async fn poll_due(&self, due: &HashSet<String>) -> Result<Snapshot, PollError> {
        for device in due {
            let Some(manager) = self.devices.get(device) else {
                continue;
            };
            if manager.should_force_reconnect().await {
                warn!(device = %device, "forcing reconnect before poll");
                if !manager.reconnect_on_error().await {
                    error!(device = %device, "forced reconnect failed, cycle aborted");
                    return Err(PollError::ReconnectFailed {
                        device: device.clone(),
                    });
                }
            }
        }

        let previous = self.latest.read().await.clone();
        let mut snapshot = Snapshot::new();
        let mut batches: BTreeMap<&str, Vec<&RegisterItem>> = BTreeMap::new();
        for item in self.enabled_items() {
            if due.contains(&item.device) {
                batches.entry(item.device.as_str()).or_default().push(item);
            } else {
                snapshot.insert(item.name.clone(), previous.get(&item.name).copied().flatten());
            }
        }

        let results = join_all(
            batches
                .into_iter()
                .map(|(device, items)| self.poll_batch(device, items)),
        )
        .await;
        for batch in results {
            snapshot.extend(batch);
        }

        self.add_aggregates(&mut snapshot);
        *self.latest.write().await = snapshot.clone();
        Ok(snapshot)
    }

    /// Items to read this cycle. The oracle is asked once per item; items it
    /// has never seen fall back to their registration default. Write-only
    /// registers are never polled.
    fn enabled_items(&self) -> Vec<&RegisterItem> {
        self.items
            .iter()
            .filter(|item| item.access.readable())
            .filter(|item| {
                self.oracle
                    .is_enabled(&item.name)
                    .unwrap_or(item.enabled_by_default)
            })
            .collect()
    }

    async fn poll_batch(
        &self,
        device: &str,
        items: Vec<&RegisterItem>,
    ) -> Vec<(String, Option<f64>)> {
        let Some(manager) = self.devices.get(device) else {
            warn!(device, "no connection for device, items left empty");
            return items.iter().map(|i| (i.name.clone(), None)).collect();
        };

        let reads = items.into_iter().map(|item| {
            let manager = manager.clone();
            async move { (item.name.clone(), manager.read(item).await) }
        });
        let values = join_all(reads).await;

        let failed = values.iter().filter(|(_, v)| v.is_none()).count();
        if failed > 0 {
            warn!(device, failed, total = values.len(), "some reads failed");
        }
        let health = manager.connection_health().await;
        debug!(
            device,
            health = %serde_json::to_string(&health).unwrap_or_default(),
            "batch done"
        );
        values
    }

    fn add_aggregates(&self, snapshot: &mut Snapshot) {
        let collect = |measure: Measure| -> Vec<f64> {
            self.items
                .iter()
                .filter(|i| i.measure == Some(measure))
                .filter_map(|i| snapshot.get(&i.name).copied().flatten())
                .collect()
        };

        let soc = collect(Measure::Soc);
        let power = collect(Measure::Power);
        let produced = collect(Measure::EnergyProduced);
        let consumed = collect(Measure::EnergyConsumed);

        let mean = |v: &[f64]| (!v.is_empty()).then(|| v.iter().sum::<f64>() / v.len() as f64);
        let sum = |v: &[f64]| (!v.is_empty()).then(|| v.iter().sum::<f64>());

        snapshot.insert(COMBINED_SOC.to_owned(), mean(&soc));
        snapshot.insert(COMBINED_POWER.to_owned(), sum(&power));
        snapshot.insert(CUMULATIVE_ENERGY_PRODUCED.to_owned(), sum(&produced));
        snapshot.insert(CUMULATIVE_ENERGY_CONSUMED.to_owned(), sum(&consumed));
    }

    fn due_devices(&self, last_polled: &HashMap<String, Instant>, now: Instant) -> HashSet<String> {
        self.devices
            .keys()
            .filter(|device| {
                if self.primary.as_deref() == Some(device.as_str()) {
                    return true;
                }
                match last_polled.get(*device) {
                    Some(last) => now.saturating_duration_since(*last) >= self.secondary_interval,
                    None => true,
                }
            })
            .cloned()
            .collect()
    }

    /// Tick at the primary interval forever. Secondary devices are read when
    /// their own interval has elapsed.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.primary_interval);
        let mut last_polled: HashMap<String, Instant> = HashMap::new();
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let due = self.due_devices(&last_polled, now);
            match self.poll_due(&due).await {
                Ok(snapshot) => {
                    for device in due {
                        last_polled.insert(device, now);
                    }
                    info!(
                        items = snapshot.len(),
                        combined_soc = ?snapshot.get(COMBINED_SOC).copied().flatten(),
                        "poll cycle complete"
                    );
                }
                Err(e) => error!(error = %e, "poll cycle failed, data is stale"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::client::mock::MockDevice;
    use crate::battery::{AccessMode, DataType};
    use std::io;

    fn item(name: &str, device: &str, address: u16) -> RegisterItem {
        RegisterItem::new(name, device, 40, address, DataType::Uint16, AccessMode::ReadOnly)
    }

    fn scheduler(
        devices: &[(&str, &MockDevice)],
        items: Vec<RegisterItem>,
        oracle: HashMap<String, bool>,
    ) -> PollScheduler {
        PollScheduler::new(
            devices
                .iter()
                .map(|(name, dev)| Arc::new(dev.manager(name)))
                .collect(),
            items,
            Arc::new(oracle),
            Arc::new(RwLock::new(Snapshot::new())),
        )
    }

    #[tokio::test]
    async fn failed_item_is_null_not_missing() {
        let a = MockDevice::default();
        let b = MockDevice::default();
        a.set(40, 1, 11);
        a.set(40, 2, 12);
        b.set(40, 1, 21);
        b.state()
            .read_errors
            .insert((40, 1), io::ErrorKind::ConnectionRefused);

        let s = scheduler(
            &[("a", &a), ("b", &b)],
            vec![item("a_one", "a", 1), item("a_two", "a", 2), item("b_one", "b", 1)],
            HashMap::new(),
        );
        let snapshot = s.poll_once().await.unwrap();

        let raw: Vec<_> = snapshot
            .iter()
            .filter(|(k, _)| k.starts_with("a_") || k.starts_with("b_"))
            .collect();
        assert_eq!(raw.len(), 3);
        assert_eq!(snapshot["a_one"], Some(11.0));
        assert_eq!(snapshot["a_two"], Some(12.0));
        assert_eq!(snapshot["b_one"], None);
        assert_eq!(*s.latest().read().await, snapshot);
    }

    #[tokio::test]
    async fn enablement_filter() {
        let a = MockDevice::default();
        let items = vec![
            item("a_seen_off", "a", 1),
            item("a_unseen", "a", 2),
            item("a_default_off", "a", 3).disabled_by_default(),
            item("a_default_off_enabled", "a", 4).disabled_by_default(),
            RegisterItem::new("a_pilot", "a", 64, 41, DataType::Int16, AccessMode::WriteOnly),
        ];
        let oracle = HashMap::from([
            ("a_seen_off".to_owned(), false),
            ("a_default_off_enabled".to_owned(), true),
        ]);
        let s = scheduler(&[("a", &a)], items, oracle);
        let snapshot = s.poll_once().await.unwrap();

        assert!(snapshot.contains_key("a_unseen"));
        assert!(snapshot.contains_key("a_default_off_enabled"));
        assert!(!snapshot.contains_key("a_seen_off"));
        assert!(!snapshot.contains_key("a_default_off"));
        assert!(!snapshot.contains_key("a_pilot"));
        assert!(a.calls().iter().all(|c| !matches!(
            c,
            crate::battery::client::mock::Call::Read { address: 41, .. }
        )));
    }

    #[tokio::test]
    async fn aggregates() {
        let a = MockDevice::default();
        let b = MockDevice::default();
        a.set(40, 46, 40);
        b.set(40, 46, 60);
        a.set(40, 47, 1000);
        b.set(40, 47, 500);

        let items = vec![
            item("a_soc", "a", 46).with_measure(Measure::Soc),
            item("b_soc", "b", 46).with_measure(Measure::Soc),
            item("a_power", "a", 47).with_measure(Measure::Power),
            item("b_power", "b", 47).with_measure(Measure::Power),
            item("a_produced", "a", 17).with_measure(Measure::EnergyProduced),
        ];
        b.state()
            .read_errors
            .insert((40, 47), io::ErrorKind::InvalidData);

        let s = scheduler(&[("a", &a), ("b", &b)], items, HashMap::new());
        let snapshot = s.poll_once().await.unwrap();
        assert_eq!(snapshot[COMBINED_SOC], Some(50.0));
        assert_eq!(snapshot[COMBINED_POWER], Some(1000.0));
        assert_eq!(snapshot[CUMULATIVE_ENERGY_PRODUCED], Some(0.0));
        assert_eq!(snapshot[CUMULATIVE_ENERGY_CONSUMED], None);
    }

    #[tokio::test]
    async fn failed_forced_reconnect_aborts_cycle() {
        let a = MockDevice::default();
        a.set(40, 1, 7);
        let s = scheduler(&[("a", &a)], vec![item("a_one", "a", 1)], HashMap::new());
        assert_eq!(s.poll_once().await.unwrap()["a_one"], Some(7.0));

        a.state().refuse_all = true;
        let manager = s.devices["a"].clone();
        for _ in 0..11 {
            assert!(!manager.connect().await);
        }
        assert!(manager.should_force_reconnect().await);

        assert!(matches!(
            s.poll_once().await,
            Err(PollError::ReconnectFailed { device }) if device == "a"
        ));
        // previous snapshot stays published
        assert_eq!(s.latest().read().await["a_one"], Some(7.0));
    }

    #[tokio::test]
    async fn forced_reconnect_recovers() {
        let a = MockDevice::default();
        a.set(40, 1, 7);
        let s = scheduler(&[("a", &a)], vec![item("a_one", "a", 1)], HashMap::new());
        a.state().refuse_connects = 11;
        let manager = s.devices["a"].clone();
        for _ in 0..11 {
            assert!(!manager.connect().await);
        }
        let snapshot = s.poll_once().await.unwrap();
        assert_eq!(snapshot["a_one"], Some(7.0));
        assert_eq!(manager.health().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn secondary_values_carry_forward() {
        let a = MockDevice::default();
        let b = MockDevice::default();
        a.set(40, 1, 1);
        b.set(40, 1, 2);
        let s = scheduler(
            &[("a", &a), ("b", &b)],
            vec![item("a_one", "a", 1), item("b_one", "b", 1)],
            HashMap::new(),
        )
        .with_primary("a")
        .with_intervals(Duration::from_secs(10), Duration::from_secs(30));

        let mut last = HashMap::new();
        let t0 = Instant::now();
        let due = s.due_devices(&last, t0);
        assert_eq!(due.len(), 2);
        s.poll_due(&due).await.unwrap();
        for d in due {
            last.insert(d, t0);
        }

        a.set(40, 1, 10);
        b.set(40, 1, 20);
        let due = s.due_devices(&last, t0 + Duration::from_secs(10));
        assert_eq!(due, HashSet::from(["a".to_owned()]));
        let snapshot = s.poll_due(&due).await.unwrap();
        assert_eq!(snapshot["a_one"], Some(10.0));
        assert_eq!(snapshot["b_one"], Some(2.0));

        let due = s.due_devices(&last, t0 + Duration::from_secs(30));
        assert_eq!(due.len(), 2);
        let snapshot = s.poll_due(&due).await.unwrap();
        assert_eq!(snapshot["b_one"], Some(20.0));
    }
}
