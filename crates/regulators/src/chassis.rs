//! A chassis in the regulators configuration.

use crate::device::Device;
use crate::environment::DeviceHandles;
use crate::error_logging::ErrorHistory;
use crate::rule::Rules;
use services::Services;

/// A chassis containing regulator devices. Numbers start at 1; chassis 0
/// represents the entire system.
pub struct Chassis {
    number: usize,
    inventory_path: String,
    devices: Vec<Device>,
}

impl Chassis {
    pub fn new(number: usize, inventory_path: &str, devices: Vec<Device>) -> Self {
        Self {
            number,
            inventory_path: inventory_path.to_string(),
            devices,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn inventory_path(&self) -> &str {
        &self.inventory_path
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut [Device] {
        &mut self.devices
    }

    /// Configures every device in the chassis.
    pub fn configure(
        &mut self,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) {
        services.log_info(&format!("Configuring chassis {}", self.number));
        for device in &mut self.devices {
            device.clear_cache();
            device.configure(rules, handles, services);
        }
    }

    /// Reads and publishes sensors for every device in the chassis.
    pub fn monitor_sensors(
        &mut self,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
        history: &mut ErrorHistory,
    ) {
        let inventory_path = self.inventory_path.clone();
        for device in &mut self.devices {
            device.monitor_sensors(&inventory_path, rules, handles, services, history);
        }
    }

    /// Closes all device I2C interfaces. Never fails.
    pub fn close_devices(&mut self, handles: &mut DeviceHandles, services: &mut dyn Services) {
        services.log_info(&format!("Closing devices in chassis {}", self.number));
        for device in &mut self.devices {
            device.close(handles);
        }
    }
}
