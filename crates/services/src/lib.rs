//! System-services facade.
//!
//! Everything the power core needs from the rest of the BMC goes through the
//! [`Services`] trait: journal logging, structured error events, hardware
//! presence, GPIO access, VPD, PMBus adapter creation, chassis status
//! monitoring, and sensor publication. The host implementation talks to the
//! real services; the `sim` crate provides a scripted implementation for
//! tests and `--sim` runs.

use pmbus::Pmbus;
use sensors::Sensors;
use std::collections::BTreeMap;
use thiserror::Error;
use types::Severity;

#[cfg(target_os = "linux")]
mod gpio;
#[cfg(target_os = "linux")]
mod host;
#[cfg(target_os = "linux")]
pub use host::HostServices;

/// Additional data attached to a logged error event.
pub type AdditionalData = BTreeMap<String, String>;

/// Facade-layer failure.
#[derive(Debug, Clone, Error)]
pub enum ServicesError {
    #[error("Unable to determine presence of {inventory_path}: {description}")]
    Presence {
        inventory_path: String,
        description: String,
    },

    #[error("Unable to read GPIO chip {chip_label}: {description}")]
    GpioChip {
        chip_label: String,
        description: String,
    },

    #[error("Unable to access GPIO line {line_name}: {description}")]
    GpioLine {
        line_name: String,
        description: String,
    },

    #[error("Unable to read VPD keyword {keyword} of {inventory_path}: {description}")]
    Vpd {
        inventory_path: String,
        keyword: String,
        description: String,
    },

    #[error("D-Bus error: {0}")]
    DBus(String),
}

bitflags::bitflags! {
    /// Which chassis status properties are monitored.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MonitorOptions: u8 {
        const PRESENCE           = 0x01;
        const AVAILABILITY       = 0x02;
        const POWER_STATE        = 0x04;
        const INPUT_POWER        = 0x08;
        const POWER_GOOD         = 0x10;
        const POWER_SUPPLY_POWER = 0x20;
    }
}

/// Reader of the upstream chassis status properties.
///
/// This is the only reader of presence/availability/enablement/input-power
/// state for a chassis; the power core owns the power state and power good
/// properties itself.
pub trait ChassisStatusMonitor: Send {
    fn chassis_number(&self) -> usize;
    fn is_present(&self) -> Result<bool, ServicesError>;
    fn is_available(&self) -> Result<bool, ServicesError>;
    fn is_enabled(&self) -> Result<bool, ServicesError>;
    fn is_input_power_good(&self) -> Result<bool, ServicesError>;
    fn is_power_supplies_power_good(&self) -> Result<bool, ServicesError>;
}

/// Interface to system services.
pub trait Services: Send {
    /// Logs an informational message in the journal.
    fn log_info(&mut self, message: &str);

    /// Logs an error message in the journal.
    fn log_error(&mut self, message: &str);

    /// Logs an error event with severity and additional data.
    ///
    /// Failures to log are swallowed after writing a journal message; error
    /// logging must never take down the caller.
    fn log_event(&mut self, message: &str, severity: Severity, additional_data: AdditionalData);

    /// Returns whether the hardware at the inventory path is present.
    fn is_present(&mut self, inventory_path: &str) -> Result<bool, ServicesError>;

    /// Reads all line values of the GPIO chip with the given label in one
    /// call, indexed by line offset.
    fn gpio_values(&mut self, chip_label: &str) -> Result<Vec<u8>, ServicesError>;

    /// Reads the value of one named GPIO line.
    fn read_gpio(&mut self, line_name: &str) -> Result<u8, ServicesError>;

    /// Drives one named GPIO line.
    fn set_gpio(&mut self, line_name: &str, value: u8) -> Result<(), ServicesError>;

    /// Returns the value of a VPD keyword for the given hardware.
    fn vpd_value(&mut self, inventory_path: &str, keyword: &str)
        -> Result<Vec<u8>, ServicesError>;

    /// Creates a PMBus adapter for a device bound to a PMBus driver.
    fn create_pmbus(
        &mut self,
        bus: u8,
        address: u16,
        driver_name: &str,
        instance: usize,
    ) -> Box<dyn Pmbus>;

    /// Creates a status monitor for one chassis.
    fn create_status_monitor(
        &mut self,
        chassis_number: usize,
        inventory_path: &str,
        options: MonitorOptions,
    ) -> Box<dyn ChassisStatusMonitor>;

    /// Sensor publication service.
    fn sensors(&mut self) -> &mut dyn Sensors;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_options() {
        let options = MonitorOptions::all() & !MonitorOptions::POWER_STATE;
        assert!(options.contains(MonitorOptions::PRESENCE));
        assert!(!options.contains(MonitorOptions::POWER_STATE));
    }
}
