//! Pilot control: power setpoint dispatch.
//!
//! The inverter takes the power setpoint and its power factor as one
//! register pair. Writing them apart leaves a window where the device acts
//! on a half-updated setpoint, so halves are staged per device until both
//! are known and then written in a single request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::battery::client::ConnectionManager;
use crate::battery::{codec, ModbusError, RegisterItem};
use crate::pilot::soc::{SocConstraintEngine, SocConstraintResult};
use crate::poll::SharedSnapshot;

pub mod soc;

/// Upper bound of the raw power factor in the ten-thousandths convention.
pub const MAX_RAW_POWER_FACTOR: f64 = 10000.0;

#[derive(Debug, Error)]
pub enum PilotError {
    #[error("pilot registers of {device} are not contiguous on one unit")]
    NotContiguous { device: String },

    #[error("pilot registers of {device} must be writable")]
    NotWritable { device: String },
}

/// How the raw power factor register is scaled.
///
/// `Auto` guesses from magnitude: raw values up to and including 1000 are
/// read as thousandths, larger ones as ten-thousandths. A raw 1000 is
/// therefore 1.0, never 0.1. Prefer an explicit scale when the device
/// convention is known.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PowerFactorScale {
    Auto,
    Milli,
    TenThousandths,
}

impl PowerFactorScale {
    /// Normalise a raw register value to 0..=1.
    pub fn normalize(&self, raw: f64) -> Result<f64, ModbusError> {
        if !raw.is_finite() || raw < 0.0 || raw > MAX_RAW_POWER_FACTOR {
            return Err(ModbusError::InvalidPowerFactor(raw));
        }
        let divisor = match self {
            PowerFactorScale::Auto if raw > 1000.0 => 10000.0,
            PowerFactorScale::Auto | PowerFactorScale::Milli => 1000.0,
            PowerFactorScale::TenThousandths => 10000.0,
        };
        let normalized = raw / divisor;
        if (0.0..=1.0).contains(&normalized) {
            Ok(normalized)
        } else {
            Err(ModbusError::InvalidPowerFactor(raw))
        }
    }

    /// Register factor for an explicit scale.
    fn register_factor(&self) -> Option<f64> {
        match self {
            PowerFactorScale::Auto => None,
            PowerFactorScale::Milli => Some(0.001),
            PowerFactorScale::TenThousandths => Some(0.0001),
        }
    }
}

/// Staged half of a pilot write.
#[derive(Debug, Clone)]
pub struct PilotTransaction {
    pub power: Option<f64>,
    pub power_factor: Option<f64>,
    pub created_at: Instant,
}

impl PilotTransaction {
    fn new(created_at: Instant) -> Self {
        Self {
            power: None,
            power_factor: None,
            created_at,
        }
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.created_at) > timeout
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Half {
    Power(f64),
    PowerFactor(f64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PilotWrite {
    /// Both registers went out in one request
    Written,
    /// Waiting for the other half
    Pending,
    Failed,
}

impl PilotWrite {
    pub fn is_ok(&self) -> bool {
        *self != PilotWrite::Failed
    }
}

/// The pilot register pair of one device.
pub struct PilotTarget {
    manager: Arc<ConnectionManager>,
    power: RegisterItem,
    power_factor: RegisterItem,
}

impl PilotTarget {
    pub fn new(
        manager: Arc<ConnectionManager>,
        power: RegisterItem,
        power_factor: RegisterItem,
    ) -> Result<Self, PilotError> {
        let device = manager.device().to_owned();
        if !power.access.writable() || !power_factor.access.writable() {
            return Err(PilotError::NotWritable { device });
        }
        if power.slave != power_factor.slave
            || power.address.checked_add(power.data_type.word_count()) != Some(power_factor.address)
        {
            return Err(PilotError::NotContiguous { device });
        }
        Ok(Self {
            manager,
            power,
            power_factor,
        })
    }
}

pub struct TransactionCoordinator {
    targets: HashMap<String, PilotTarget>,
    pending: Mutex<HashMap<String, PilotTransaction>>,
    /// Last pair written per device, as sent on the wire
    committed: Mutex<HashMap<String, (f64, f64)>>,
    snapshot: SharedSnapshot,
    soc: Option<Arc<SocConstraintEngine>>,
    timeout: Duration,
    scale: PowerFactorScale,
}

impl TransactionCoordinator {
    pub fn new(snapshot: SharedSnapshot, timeout: Duration, scale: PowerFactorScale) -> Self {
        Self {
            targets: HashMap::new(),
            pending: Mutex::new(HashMap::new()),
            committed: Mutex::new(HashMap::new()),
            snapshot,
            soc: None,
            timeout,
            scale,
        }
    }

    /// Every pair goes through the SOC limits before it is written.
    pub fn with_soc_constraint(mut self, soc: Arc<SocConstraintEngine>) -> Self {
        self.soc = Some(soc);
        self
    }

    pub fn add_target(&mut self, mut target: PilotTarget) {
        if let Some(factor) = self.scale.register_factor() {
            target.power_factor.factor = factor;
        }
        self.targets
            .insert(target.manager.device().to_owned(), target);
    }

    pub async fn write_power(&self, device: &str, power: f64) -> bool {
        self.submit(device, Half::Power(power)).await.is_ok()
    }

    pub async fn write_power_factor(&self, device: &str, power_factor: f64) -> bool {
        self.submit(device, Half::PowerFactor(power_factor)).await.is_ok()
    }

    /// Route a write addressed to a pilot register by item key. `None` when
    /// `key` is not a pilot register.
    pub async fn write_item(&self, key: &str, value: f64) -> Option<PilotWrite> {
        let (device, half) = self.targets.iter().find_map(|(device, target)| {
            if target.power.name == key {
                Some((device, Half::Power(value)))
            } else if target.power_factor.name == key {
                Some((device, Half::PowerFactor(value)))
            } else {
                None
            }
        })?;
        Some(self.submit(device, half).await)
    }

    /// Stage one half, or write the pair when the other half is known.
    pub async fn submit(&self, device: &str, half: Half) -> PilotWrite {
        let Some(target) = self.targets.get(device) else {
            warn!(device, "no pilot registers for device");
            return PilotWrite::Failed;
        };

        let valid = match half {
            Half::Power(p) => codec::encode(p, &target.power).map(|_| ()),
            Half::PowerFactor(pf) => self.check_power_factor(target, pf).map(|_| ()),
        };
        if let Err(e) = valid {
            self.pending.lock().await.remove(device);
            warn!(device, ?half, error = %e, "pilot pair aborted");
            return PilotWrite::Failed;
        }

        let pair = {
            let mut pending = self.pending.lock().await;
            let now = Instant::now();
            if pending
                .get(device)
                .is_some_and(|tx| tx.is_expired(now, self.timeout))
            {
                pending.remove(device);
                info!(device, "stale pilot transaction discarded");
            }

            let staged = pending.get(device);
            let committed = self.committed.lock().await.get(device).copied();
            let (power, power_factor) = match half {
                Half::Power(p) => {
                    let pf = match staged.and_then(|tx| tx.power_factor) {
                        Some(pf) => Some(pf),
                        None => match committed {
                            Some((_, pf)) => Some(pf),
                            None => self.known(&target.power_factor).await,
                        },
                    };
                    (Some(p), pf)
                }
                Half::PowerFactor(pf) => {
                    let p = match staged.and_then(|tx| tx.power) {
                        Some(p) => Some(p),
                        None => match committed {
                            Some((p, _)) => Some(p),
                            None => self.known(&target.power).await,
                        },
                    };
                    (p, Some(pf))
                }
            };

            match (power, power_factor) {
                (Some(p), Some(pf)) => {
                    pending.remove(device);
                    Some((p, pf))
                }
                _ => {
                    let tx = pending
                        .entry(device.to_owned())
                        .or_insert_with(|| PilotTransaction::new(now));
                    match half {
                        Half::Power(p) => tx.power = Some(p),
                        Half::PowerFactor(pf) => tx.power_factor = Some(pf),
                    }
                    debug!(device, ?half, "pilot half staged");
                    None
                }
            }
        };

        match pair {
            Some((power, power_factor)) => self.write_pair(target, power, power_factor).await,
            None => PilotWrite::Pending,
        }
    }

    /// Write both halves now, dropping anything staged for the device.
    pub async fn write_pilot_power(&self, device: &str, power: f64, power_factor: f64) -> bool {
        let Some(target) = self.targets.get(device) else {
            warn!(device, "no pilot registers for device");
            return false;
        };
        self.pending.lock().await.remove(device);
        self.write_pair(target, power, power_factor).await == PilotWrite::Written
    }

    pub async fn committed(&self, device: &str) -> Option<(f64, f64)> {
        self.committed.lock().await.get(device).copied()
    }

    async fn known(&self, item: &RegisterItem) -> Option<f64> {
        self.snapshot.read().await.get(&item.name).copied().flatten()
    }

    /// `pf` is what the device sees after descaling with the register
    /// factor, so it must be in 0..=1 whatever scale the raw value implies.
    fn check_power_factor(&self, target: &PilotTarget, pf: f64) -> Result<f64, ModbusError> {
        if !(0.0..=1.0).contains(&pf) {
            return Err(ModbusError::InvalidPowerFactor(pf));
        }
        self.scale
            .normalize(codec::to_raw(pf, &target.power_factor))
    }

    fn encode_pair(
        &self,
        target: &PilotTarget,
        power: f64,
        power_factor: f64,
    ) -> Result<Vec<u16>, ModbusError> {
        self.check_power_factor(target, power_factor)?;
        let mut words = codec::encode(power, &target.power)?;
        words.extend(codec::encode(power_factor, &target.power_factor)?);
        Ok(words)
    }

    async fn constrain(&self, device: &str, power: f64) -> f64 {
        let Some(soc) = &self.soc else {
            return power;
        };
        let constraint = soc.check(power).await;
        if !constraint.allowed {
            info!(
                device,
                requested = power,
                commanded = constraint.constrained_value,
                reason = ?constraint.reason,
                "pilot power constrained"
            );
        }
        constraint.constrained_value
    }

    async fn write_pair(&self, target: &PilotTarget, power: f64, power_factor: f64) -> PilotWrite {
        let device = target.manager.device();
        // validate before the SOC check, which may write the discharge limit
        if let Err(e) = self.encode_pair(target, power, power_factor) {
            warn!(device, power, power_factor, error = %e, "pilot pair rejected");
            return PilotWrite::Failed;
        }
        let power = self.constrain(device, power).await;
        let words = match self.encode_pair(target, power, power_factor) {
            Ok(words) => words,
            Err(e) => {
                warn!(device, power, power_factor, error = %e, "pilot pair rejected");
                return PilotWrite::Failed;
            }
        };

        if target
            .manager
            .write_block(target.power.slave, target.power.address, &words)
            .await
        {
            self.committed
                .lock()
                .await
                .insert(device.to_owned(), (power, power_factor));
            info!(device, power, power_factor, "pilot setpoint written");
            PilotWrite::Written
        } else {
            PilotWrite::Failed
        }
    }

    /// Drop transactions older than the timeout without writing them.
    pub async fn purge_expired(&self, now: Instant) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|device, tx| {
            let expired = tx.is_expired(now, self.timeout);
            if expired {
                info!(
                    device = %device,
                    power = ?tx.power,
                    power_factor = ?tx.power_factor,
                    "pilot transaction expired"
                );
            }
            !expired
        });
        before - pending.len()
    }

    pub async fn pending(&self, device: &str) -> Option<PilotTransaction> {
        self.pending.lock().await.get(device).cloned()
    }

    pub fn spawn_sweep(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                coordinator.purge_expired(Instant::now()).await;
            }
        })
    }
}

/// Pilot commands for the designated device.
pub struct PilotDispatcher {
    device: String,
    soc: Arc<SocConstraintEngine>,
    coordinator: Arc<TransactionCoordinator>,
}

impl PilotDispatcher {
    pub fn new(
        device: impl Into<String>,
        soc: Arc<SocConstraintEngine>,
        coordinator: Arc<TransactionCoordinator>,
    ) -> Self {
        Self {
            device: device.into(),
            soc,
            coordinator,
        }
    }

    pub async fn check_soc_constraint(&self, power: f64) -> SocConstraintResult {
        self.soc.check(power).await
    }

    /// The coordinator applies the SOC limits before writing.
    pub async fn write_pilot_power(&self, power: f64, power_factor: f64) -> bool {
        self.coordinator
            .write_pilot_power(&self.device, power, power_factor)
            .await
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }
}
