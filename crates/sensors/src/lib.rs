//! Voltage rail sensor publication.
//!
//! Each voltage rail may publish several sensor types (see
//! [`types::SensorType`]). Reading every rail once is a monitoring cycle;
//! during a cycle the methods must be called in the order `start_cycle`,
//! then per rail `start_rail` / `set_value` / `end_rail`, then `end_cycle`.
//!
//! Sensors that stop receiving updates are pruned at the end of the cycle,
//! which handles hardware that was removed or replaced.

use std::collections::BTreeMap;
use std::time::Instant;
use tracing::debug;
use types::SensorType;

/// Sensor value update policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdatePolicy {
    /// Publish only when the change is at least the hysteresis amount.
    Hysteresis,
    /// Publish only when the new value is higher than the current one. The
    /// regulator clears its internal peak on read, so the published value is
    /// the highest seen since the sensors were last disabled.
    Highest,
    /// Publish only when the new value is lower than the current one.
    Lowest,
}

/// Measurement unit of a published sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Amperes,
    Watts,
    DegreesC,
    Volts,
}

/// Fixed per-type publication properties.
///
/// The voltage hysteresis is deliberately tiny: small voltage changes can be
/// significant and must not be hidden.
fn type_properties(sensor_type: SensorType) -> (Unit, f64, f64, UpdatePolicy, f64) {
    use SensorType::*;
    match sensor_type {
        Iout => (Unit::Amperes, 0.0, 500.0, UpdatePolicy::Hysteresis, 1.0),
        IoutPeak => (Unit::Amperes, 0.0, 500.0, UpdatePolicy::Highest, 0.0),
        IoutValley => (Unit::Amperes, 0.0, 500.0, UpdatePolicy::Lowest, 0.0),
        Pout => (Unit::Watts, 0.0, 1000.0, UpdatePolicy::Hysteresis, 1.0),
        Temperature => (Unit::DegreesC, -50.0, 250.0, UpdatePolicy::Hysteresis, 1.0),
        TemperaturePeak => (Unit::DegreesC, -50.0, 250.0, UpdatePolicy::Highest, 0.0),
        Vout => (Unit::Volts, -15.0, 15.0, UpdatePolicy::Hysteresis, 0.001),
        VoutPeak => (Unit::Volts, -15.0, 15.0, UpdatePolicy::Highest, 0.0),
        VoutValley => (Unit::Volts, -15.0, 15.0, UpdatePolicy::Lowest, 0.0),
    }
}

/// One published sensor: a single sensor type for a single voltage rail.
#[derive(Debug)]
pub struct Sensor {
    name: String,
    sensor_type: SensorType,
    rail: String,
    device_inventory_path: String,
    chassis_inventory_path: String,
    unit: Unit,
    min_value: f64,
    max_value: f64,
    policy: UpdatePolicy,
    hysteresis: f64,
    value: f64,
    functional: bool,
    available: bool,
    last_update: Instant,
}

impl Sensor {
    fn new(
        name: &str,
        sensor_type: SensorType,
        value: f64,
        rail: &str,
        device_inventory_path: &str,
        chassis_inventory_path: &str,
    ) -> Self {
        let (unit, min_value, max_value, policy, hysteresis) = type_properties(sensor_type);
        debug!(name, ?unit, value, "Sensor created");
        Self {
            name: name.to_string(),
            sensor_type,
            rail: rail.to_string(),
            device_inventory_path: device_inventory_path.to_string(),
            chassis_inventory_path: chassis_inventory_path.to_string(),
            unit,
            min_value,
            max_value,
            policy,
            hysteresis,
            value,
            functional: true,
            available: true,
            last_update: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sensor_type(&self) -> SensorType {
        self.sensor_type
    }

    pub fn rail(&self) -> &str {
        &self.rail
    }

    pub fn device_inventory_path(&self) -> &str {
        &self.device_inventory_path
    }

    pub fn chassis_inventory_path(&self) -> &str {
        &self.chassis_inventory_path
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn min_value(&self) -> f64 {
        self.min_value
    }

    pub fn max_value(&self) -> f64 {
        self.max_value
    }

    /// Currently published value. NaN when disabled or in the error state.
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn is_functional(&self) -> bool {
        self.functional
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    fn set_value(&mut self, value: f64) {
        if self.should_update(value) {
            debug!(name = %self.name, value, "Sensor value updated");
            self.value = value;
        }
        self.functional = true;
        self.available = true;
        self.last_update = Instant::now();
    }

    /// Marks the sensor non-functional after a failed read.
    fn set_to_error_state(&mut self) {
        self.value = f64::NAN;
        self.functional = false;
        self.last_update = Instant::now();
    }

    /// Marks the sensor unavailable; its value is no longer being updated.
    fn disable(&mut self) {
        self.value = f64::NAN;
        self.available = false;
        self.last_update = Instant::now();
    }

    fn should_update(&self, value: f64) -> bool {
        // A published NaN means disabled or errored; any real value replaces it
        if self.value.is_nan() {
            return true;
        }
        match self.policy {
            UpdatePolicy::Hysteresis => (value - self.value).abs() >= self.hysteresis,
            UpdatePolicy::Highest => value > self.value,
            UpdatePolicy::Lowest => value < self.value,
        }
    }
}

/// Sensor publication service.
///
/// Enabled while the system is powered on and regulators are producing
/// output. While disabled the sensors still exist but are inactive.
pub trait Sensors: Send {
    fn enable(&mut self);
    fn disable(&mut self);
    fn start_cycle(&mut self);
    fn start_rail(&mut self, rail: &str, device_inventory_path: &str, chassis_inventory_path: &str);
    fn set_value(&mut self, sensor_type: SensorType, value: f64);
    fn end_rail(&mut self, error_occurred: bool);
    fn end_cycle(&mut self);
}

/// In-memory implementation of [`Sensors`].
///
/// The external object name of each sensor is `<rail>_<sensortype>`.
#[derive(Debug, Default)]
pub struct RailSensors {
    sensors: BTreeMap<String, Sensor>,
    cycle_start: Option<Instant>,
    rail: String,
    device_inventory_path: String,
    chassis_inventory_path: String,
}

impl RailSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Sensor> {
        self.sensors.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl Sensors for RailSensors {
    fn enable(&mut self) {
        // Nothing to do: the next monitoring cycle sets every sensor value,
        // which moves them to the active state.
    }

    fn disable(&mut self) {
        for sensor in self.sensors.values_mut() {
            sensor.disable();
        }
    }

    fn start_cycle(&mut self) {
        self.cycle_start = Some(Instant::now());
    }

    fn start_rail(
        &mut self,
        rail: &str,
        device_inventory_path: &str,
        chassis_inventory_path: &str,
    ) {
        self.rail = rail.to_string();
        self.device_inventory_path = device_inventory_path.to_string();
        self.chassis_inventory_path = chassis_inventory_path.to_string();
    }

    fn set_value(&mut self, sensor_type: SensorType, value: f64) {
        let name = format!("{}_{}", self.rail, sensor_type);
        match self.sensors.get_mut(&name) {
            Some(sensor) => sensor.set_value(value),
            None => {
                let sensor = Sensor::new(
                    &name,
                    sensor_type,
                    value,
                    &self.rail,
                    &self.device_inventory_path,
                    &self.chassis_inventory_path,
                );
                self.sensors.insert(name, sensor);
            }
        }
    }

    fn end_rail(&mut self, error_occurred: bool) {
        if error_occurred {
            for sensor in self.sensors.values_mut() {
                if sensor.rail == self.rail {
                    sensor.set_to_error_state();
                }
            }
        }
        self.rail.clear();
        self.device_inventory_path.clear();
        self.chassis_inventory_path.clear();
    }

    fn end_cycle(&mut self) {
        // Prune sensors that were not updated during this cycle; their
        // hardware was removed or replaced.
        if let Some(cycle_start) = self.cycle_start {
            self.sensors
                .retain(|_, sensor| sensor.last_update >= cycle_start);
        }
    }
}
