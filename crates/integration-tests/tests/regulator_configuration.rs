//! Integration tests for regulator configuration and sensor monitoring.
//!
//! Run with: cargo test --test regulator_configuration

use i2c::I2c;
use pmbus::VOUT_COMMAND;
use serde_json::json;
use sim::{SimI2c, SimServices};
use std::collections::BTreeMap;
use types::SensorType;

/// Parses a regulators config tree, remembering the simulated I2C device
/// behind every configured bus/address pair.
fn parse_with_sim(
    config: &serde_json::Value,
    services: &mut SimServices,
) -> (regulators::System, BTreeMap<(u8, u16), SimI2c>) {
    let devices: BTreeMap<(u8, u16), SimI2c> = BTreeMap::new();
    let shared = std::sync::Arc::new(std::sync::Mutex::new(devices));
    let factory_devices = std::sync::Arc::clone(&shared);
    let mut factory = move |bus: u8, address: u16| {
        Box::new(
            factory_devices
                .lock()
                .unwrap()
                .entry((bus, address))
                .or_insert_with(|| SimI2c::new(bus, address))
                .clone(),
        ) as Box<dyn I2c>
    };

    // Tests run concurrently; give each parse its own directory
    static NEXT_DIR: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
    let unique = NEXT_DIR.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("vrd_reg_it_{}_{unique}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("regulators.json");
    std::fs::write(&path, serde_json::to_string_pretty(config).unwrap()).unwrap();
    let system = regulators::config::parse(&path, &mut factory, services).unwrap();
    std::fs::remove_dir_all(&dir).unwrap();

    let devices = shared.lock().unwrap().clone();
    (system, devices)
}

fn vdd_config() -> serde_json::Value {
    json!({
        "rules": [
            {
                "id": "enable_output_rule",
                "actions": [
                    {"i2c_write_bit": {"register": "0x01", "position": 7, "value": 1}}
                ]
            },
            {
                "id": "set_voltage_rule",
                "actions": [
                    {"pmbus_write_vout_command": {"format": "linear", "is_verified": true}}
                ]
            },
            {
                "id": "read_sensors_rule",
                "actions": [
                    {"pmbus_read_sensor": {"type": "vout", "command": "0x8B", "format": "linear_16"}},
                    {"pmbus_read_sensor": {"type": "iout", "command": "0x8C", "format": "linear_11"}}
                ]
            }
        ],
        "chassis": [{
            "number": 1,
            "inventory_path": "/xyz/openbmc_project/inventory/system/chassis",
            "devices": [{
                "id": "vdd_regulator",
                "is_regulator": true,
                "fru": "/xyz/openbmc_project/inventory/system/chassis/motherboard/reg1",
                "i2c_interface": {"bus": 3, "address": "0x5C"},
                "configuration": {
                    "rule_id": "enable_output_rule"
                },
                "rails": [{
                    "id": "VDD",
                    "configuration": {
                        "volts": 1.3,
                        "rule_id": "set_voltage_rule"
                    },
                    "sensor_monitoring": {
                        "rule_id": "read_sensors_rule"
                    }
                }]
            }]
        }]
    })
}

fn prepare_device(device: &SimI2c) {
    // VOUT_MODE: linear, exponent -9
    device.set_register(0x20, &[0b0001_0111]);
    device.set_register(0x01, &[0x00]);
    // READ_VOUT: 666 * 2^-9 = 1.30078125 V
    device.set_register(0x8B, &[0x9A, 0x02]);
    // READ_IOUT linear-11: exponent -4, mantissa 80 = 5.0 A
    device.set_register(0x8C, &[0x50, 0xE0]);
}

#[test]
fn test_configure_writes_voltage_with_vout_mode_exponent() {
    let mut services = SimServices::new();
    let (mut system, devices) = parse_with_sim(&vdd_config(), &mut services);
    let device = devices.get(&(3, 0x5C)).unwrap();
    prepare_device(device);

    system.configure(&mut services);

    // Device configuration flipped the enable bit
    assert_eq!(device.register(0x01).unwrap(), vec![0x80]);
    // Rail configuration: 1.3V at exponent -9 = 666 = 0x029A
    assert_eq!(device.register(VOUT_COMMAND).unwrap(), vec![0x9A, 0x02]);
    // Verified write passed, so no error events were logged
    assert!(services.logged_events().is_empty());
}

#[test]
fn test_configuration_is_idempotent() {
    // Running the same configuration twice leaves the register state
    // unchanged: every write in these rules is idempotent at the bit level.
    let mut services = SimServices::new();
    let (mut system, devices) = parse_with_sim(&vdd_config(), &mut services);
    let device = devices.get(&(3, 0x5C)).unwrap();
    prepare_device(device);

    system.configure(&mut services);
    let after_first: Vec<_> = [0x01, 0x20, 0x21]
        .iter()
        .map(|reg| device.register(*reg))
        .collect();

    system.clear_caches();
    system.configure(&mut services);
    let after_second: Vec<_> = [0x01, 0x20, 0x21]
        .iter()
        .map(|reg| device.register(*reg))
        .collect();

    assert_eq!(after_first, after_second);
}

#[test]
fn test_sensor_monitoring_publishes_rail_sensors() {
    let mut services = SimServices::new();
    let (mut system, devices) = parse_with_sim(&vdd_config(), &mut services);
    let device = devices.get(&(3, 0x5C)).unwrap();
    prepare_device(device);

    system.monitor_sensors(&mut services);

    let sensors = services.rail_sensors();
    assert_eq!(sensors.len(), 2);
    let vout = sensors.get("VDD_vout").unwrap();
    assert_eq!(vout.value(), 666.0 / 512.0);
    assert_eq!(vout.sensor_type(), SensorType::Vout);
    let iout = sensors.get("VDD_iout").unwrap();
    assert_eq!(iout.value(), 5.0);

    // A second cycle with a changed reading updates past the hysteresis
    device.set_register(0x8C, &[0x70, 0xE0]);
    system.monitor_sensors(&mut services);
    assert_eq!(services.rail_sensors().get("VDD_iout").unwrap().value(), 7.0);
}

#[test]
fn test_failed_write_verification_logs_event() {
    let mut services = SimServices::new();
    let (mut system, devices) = parse_with_sim(&vdd_config(), &mut services);
    let device = devices.get(&(3, 0x5C)).unwrap();
    prepare_device(device);
    device.set_stuck_bits(VOUT_COMMAND, 0x01);

    system.configure(&mut services);

    let events = services.logged_events();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].message,
        "xyz.openbmc_project.Power.Regulators.Error.WriteVerification"
    );
    assert!(services
        .error_messages()
        .iter()
        .any(|m| m.contains("Unable to configure VDD")));
}
