use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::battery::client::ClientOptions;
use crate::battery::RegisterItem;
use crate::pilot::PowerFactorScale;

pub const DEFAULT_PATH: &str = "ess_pilot.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub poll: PollConfig,

    #[serde(default)]
    pub modbus: ModbusConfig,

    #[serde(default)]
    pub soc: SocConfig,

    #[serde(default)]
    pub pilot: PilotConfig,

    /// Registers beyond the built-in battery set
    #[serde(default)]
    pub extra_items: Vec<RegisterItem>,

    /// Item keys the host has disabled
    #[serde(default)]
    pub disabled_items: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub name: String,

    /// No host means the device is never contacted
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Unit id for telemetry registers
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// Unit id for the pilot block
    #[serde(default = "default_pilot_slave_id")]
    pub pilot_slave_id: u8,

    #[serde(default)]
    pub primary: bool,
}

fn default_port() -> u16 {
    502
}

fn default_slave_id() -> u8 {
    40
}

fn default_pilot_slave_id() -> u8 {
    64
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: Some(host.into()),
            port: default_port(),
            slave_id: default_slave_id(),
            pilot_slave_id: default_pilot_slave_id(),
            primary: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PollConfig {
    pub primary_interval_secs: u64,
    pub secondary_interval_secs: u64,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            primary_interval_secs: 10,
            secondary_interval_secs: 30,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ModbusConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub io_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            io_timeout_ms: 3000,
            reconnect_base_delay_ms: 500,
        }
    }
}

impl ModbusConfig {
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct SocConfig {
    pub enabled: bool,

    /// Percent; discharge is blocked below this
    pub min_soc: f64,
}

impl Default for SocConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_soc: 10.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PilotConfig {
    pub transaction_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub power_factor_scale: PowerFactorScale,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 2000,
            sweep_interval_ms: 500,
            power_factor_scale: PowerFactorScale::Auto,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let mut file = File::open(path)?;
        let mut json = String::new();
        file.read_to_string(&mut json)?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Config, ConfigError> {
        let cfg: Config = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no devices configured".to_owned()));
        }

        let mut names = HashSet::new();
        for dev in &self.devices {
            if !names.insert(dev.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate device {}", dev.name)));
            }
        }

        if self.devices.iter().filter(|d| d.primary).count() > 1 {
            return Err(ConfigError::Invalid("more than one primary device".to_owned()));
        }

        if !(0.0..=100.0).contains(&self.soc.min_soc) {
            return Err(ConfigError::Invalid(format!(
                "min_soc {} outside 0..=100",
                self.soc.min_soc
            )));
        }

        if self.poll.primary_interval_secs == 0 || self.poll.secondary_interval_secs == 0 {
            return Err(ConfigError::Invalid("poll intervals must be non-zero".to_owned()));
        }

        for item in &self.extra_items {
            if !names.contains(item.device.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "item {} references unknown device {}",
                    item.name, item.device
                )));
            }
        }

        Ok(())
    }

    /// The designated primary device, or the first one listed.
    pub fn primary_device(&self) -> Option<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.primary)
            .or_else(|| self.devices.first())
    }
}
