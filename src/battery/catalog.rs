use crate::battery::{AccessMode, DataType, Measure, RegisterItem};
use crate::config::DeviceConfig;

pub const SOC: u16 = 46;
pub const STATUS: u16 = 45;
pub const POWER: u16 = 47;
pub const SMARTMETER_POWER: u16 = 48;
pub const CAPACITY: u16 = 40;
pub const ENERGY_PRODUCED: u16 = 17;
pub const ENERGY_CONSUMED: u16 = 19;

/// Pilot block, power then power factor at the next address.
pub const PILOT_POWER: u16 = 41;
pub const PILOT_POWER_FACTOR: u16 = 42;
pub const MAX_DISCHARGE: u16 = 43;
pub const MAX_CHARGE: u16 = 44;

pub fn item_key(device: &str, name: &str) -> String {
    format!("{}_{}", device, name)
}

/// Every register polled or written for one battery unit.
pub fn battery_items(dev: &DeviceConfig) -> Vec<RegisterItem> {
    use AccessMode::*;
    use DataType::*;

    let telemetry = |name: &str, address: u16, data_type: DataType| {
        RegisterItem::new(
            item_key(&dev.name, name),
            &dev.name,
            dev.slave_id,
            address,
            data_type,
            ReadOnly,
        )
    };

    vec![
        telemetry("soc", SOC, Uint16).with_measure(Measure::Soc),
        telemetry("status", STATUS, Uint16),
        telemetry("power", POWER, Int16).with_measure(Measure::Power),
        telemetry("smartmeter_power", SMARTMETER_POWER, Int16),
        telemetry("capacity", CAPACITY, Uint16).with_scale(10.0, 0.0),
        telemetry("energy_produced", ENERGY_PRODUCED, Uint32)
            .with_measure(Measure::EnergyProduced)
            .disabled_by_default(),
        telemetry("energy_consumed", ENERGY_CONSUMED, Uint32)
            .with_measure(Measure::EnergyConsumed)
            .disabled_by_default(),
        max_charge_item(dev),
        max_discharge_item(dev),
        pilot_power_item(dev),
        pilot_power_factor_item(dev),
    ]
}

pub fn max_charge_item(dev: &DeviceConfig) -> RegisterItem {
    RegisterItem::new(
        item_key(&dev.name, "max_charge"),
        &dev.name,
        dev.pilot_slave_id,
        MAX_CHARGE,
        DataType::Uint16,
        AccessMode::ReadWrite,
    )
}

pub fn max_discharge_item(dev: &DeviceConfig) -> RegisterItem {
    RegisterItem::new(
        item_key(&dev.name, "max_discharge"),
        &dev.name,
        dev.pilot_slave_id,
        MAX_DISCHARGE,
        DataType::Uint16,
        AccessMode::ReadWrite,
    )
}

pub fn pilot_power_item(dev: &DeviceConfig) -> RegisterItem {
    RegisterItem::new(
        item_key(&dev.name, "pilot_power"),
        &dev.name,
        dev.pilot_slave_id,
        PILOT_POWER,
        DataType::Int16,
        AccessMode::WriteOnly,
    )
}

pub fn pilot_power_factor_item(dev: &DeviceConfig) -> RegisterItem {
    RegisterItem::new(
        item_key(&dev.name, "pilot_power_factor"),
        &dev.name,
        dev.pilot_slave_id,
        PILOT_POWER_FACTOR,
        DataType::Uint16,
        AccessMode::WriteOnly,
    )
    .with_scale(0.001, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_and_unique() {
        let dev = DeviceConfig::new("bat_a", "10.0.0.5");
        let items = battery_items(&dev);
        let mut keys: Vec<_> = items.iter().map(|i| i.name.clone()).collect();
        assert!(keys.iter().all(|k| k.starts_with("bat_a_")));
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), items.len());
        assert!(items.iter().all(|i| i.device == "bat_a"));
    }

    #[test]
    fn pilot_pair_is_contiguous() {
        let dev = DeviceConfig::new("bat_a", "10.0.0.5");
        let power = pilot_power_item(&dev);
        let factor = pilot_power_factor_item(&dev);
        assert_eq!(power.address + power.data_type.word_count(), factor.address);
        assert_eq!(power.slave, factor.slave);
        assert!(!power.access.readable() && !factor.access.readable());
    }
}
