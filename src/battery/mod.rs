use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod client;
pub mod codec;
pub mod failure;

/// Largest register count a single read holding registers request may carry.
pub const MAX_READ_COUNT: u16 = 125;

#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Error reported by the peer, kept as text for classification.
    #[error("device reported: {0}")]
    Protocol(String),

    #[error("value {value} out of range for {data_type:?} register")]
    RegisterRange { value: f64, data_type: DataType },

    #[error("invalid power factor {0}")]
    InvalidPowerFactor(f64),

    #[error("register count {0} outside 1..=125")]
    RegisterCount(u16),

    #[error("expected {expected} registers, got {got}")]
    Decode { expected: usize, got: usize },

    #[error("no host configured")]
    NoHost,

    #[error("not connected")]
    NotConnected,
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
}

impl DataType {
    pub fn word_count(&self) -> u16 {
        match self {
            DataType::Uint16 | DataType::Int16 => 1,
            DataType::Uint32 | DataType::Int32 => 2,
        }
    }

    /// Inclusive raw range the type can carry.
    pub fn range(&self) -> (f64, f64) {
        match self {
            DataType::Uint16 => (0.0, u16::MAX as f64),
            DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            DataType::Uint32 => (0.0, u32::MAX as f64),
            DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(&self) -> bool {
        *self != AccessMode::WriteOnly
    }

    pub fn writable(&self) -> bool {
        *self != AccessMode::ReadOnly
    }
}

/// What a register measures, used to build the cross-device aggregates.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    Soc,
    Power,
    EnergyProduced,
    EnergyConsumed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RegisterItem {
    /// Snapshot key
    pub name: String,

    pub address: u16,

    /// Unit / slave id on the connection
    pub slave: u8,

    pub data_type: DataType,

    /// Decoded value = (raw - offset) * factor
    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default)]
    pub offset: f64,

    pub access: AccessMode,

    /// Device tag, selects the connection and the poll batch
    pub device: String,

    #[serde(default)]
    pub measure: Option<Measure>,

    #[serde(default = "default_enabled")]
    pub enabled_by_default: bool,
}

fn default_factor() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl RegisterItem {
    pub fn new(
        name: impl Into<String>,
        device: impl Into<String>,
        slave: u8,
        address: u16,
        data_type: DataType,
        access: AccessMode,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            slave,
            data_type,
            factor: 1.0,
            offset: 0.0,
            access,
            device: device.into(),
            measure: None,
            enabled_by_default: true,
        }
    }

    pub fn with_scale(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_measure(mut self, measure: Measure) -> Self {
        self.measure = Some(measure);
        self
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_modes() {
        assert!(AccessMode::ReadOnly.readable());
        assert!(!AccessMode::ReadOnly.writable());
        assert!(!AccessMode::WriteOnly.readable());
        assert!(AccessMode::WriteOnly.writable());
        assert!(AccessMode::ReadWrite.readable() && AccessMode::ReadWrite.writable());
    }

    #[test]
    fn item_from_json() {
        let item: RegisterItem = serde_json::from_str(
            r#"{"name":"x_soc","address":46,"slave":40,"data_type":"UINT16",
                "access":"read_only","device":"x","measure":"soc"}"#,
        )
        .unwrap();
        assert_eq!(item.factor, 1.0);
        assert_eq!(item.offset, 0.0);
        assert_eq!(item.measure, Some(Measure::Soc));
        assert!(item.enabled_by_default);
    }
}
