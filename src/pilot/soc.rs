//! State of charge limits for pilot power.
//!
//! Positive power discharges the battery, negative power charges it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::battery::client::ConnectionManager;
use crate::battery::RegisterItem;
use crate::config::SocConfig;
use crate::poll::{SharedSnapshot, COMBINED_SOC};

pub const FULL_SOC: f64 = 100.0;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SocConstraintResult {
    pub allowed: bool,
    pub original_value: f64,
    pub constrained_value: f64,
    pub reason: Option<String>,
}

impl SocConstraintResult {
    fn pass(power: f64, reason: Option<String>) -> Self {
        Self {
            allowed: true,
            original_value: power,
            constrained_value: power,
            reason,
        }
    }

    fn blocked(power: f64, reason: String) -> Self {
        Self {
            allowed: false,
            original_value: power,
            constrained_value: 0.0,
            reason: Some(reason),
        }
    }
}

/// Apply the SOC limits to `power`. `soc` is the combined state of charge
/// in percent, `None` when not yet known.
pub fn evaluate(config: &SocConfig, power: f64, soc: Option<f64>) -> SocConstraintResult {
    if !config.enabled {
        return SocConstraintResult::pass(power, None);
    }
    let Some(soc) = soc else {
        return SocConstraintResult::pass(power, Some("state of charge unknown".to_owned()));
    };

    if power > 0.0 && soc < config.min_soc {
        SocConstraintResult::blocked(
            power,
            format!(
                "discharge blocked: SOC {:.1}% below minimum {:.1}%",
                soc, config.min_soc
            ),
        )
    } else if power < 0.0 && soc >= FULL_SOC {
        SocConstraintResult::blocked(power, format!("charge blocked: SOC {:.1}% is full", soc))
    } else {
        SocConstraintResult::pass(power, None)
    }
}

pub struct SocConstraintEngine {
    config: RwLock<SocConfig>,
    snapshot: SharedSnapshot,
    /// Max discharge registers zeroed when discharge is blocked
    discharge_limits: Vec<(Arc<ConnectionManager>, RegisterItem)>,
}

impl SocConstraintEngine {
    pub fn new(
        config: SocConfig,
        snapshot: SharedSnapshot,
        discharge_limits: Vec<(Arc<ConnectionManager>, RegisterItem)>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            snapshot,
            discharge_limits,
        }
    }

    pub async fn update_config(&self, config: SocConfig) {
        *self.config.write().await = config;
        info!(enabled = config.enabled, min_soc = config.min_soc, "SOC limits updated");
    }

    pub async fn config(&self) -> SocConfig {
        *self.config.read().await
    }

    /// Check `power` against the latest combined SOC.
    pub async fn check(&self, power: f64) -> SocConstraintResult {
        let config = self.config().await;
        let soc = self
            .snapshot
            .read()
            .await
            .get(COMBINED_SOC)
            .copied()
            .flatten();

        let result = evaluate(&config, power, soc);
        match &result.reason {
            Some(reason) if !result.allowed => {
                info!(power, soc = ?soc, %reason, "pilot power clamped");
            }
            Some(reason) => warn!(power, %reason, "SOC limits not applied"),
            None => debug!(power, soc = ?soc, "pilot power within SOC limits"),
        }

        if !result.allowed && power > 0.0 {
            self.enforce_discharge_limit().await;
        }
        result
    }

    /// Best effort: a failed write only logs.
    async fn enforce_discharge_limit(&self) {
        for (manager, item) in &self.discharge_limits {
            if !manager.write(0.0, item).await {
                warn!(device = manager.device(), item = %item.name, "could not zero max discharge");
            }
        }
    }
}
