//! The regulator system: rules, chassis, and device handles.

use crate::chassis::Chassis;
use crate::environment::DeviceHandles;
use crate::error_logging::ErrorHistory;
use crate::rule::Rules;
use services::Services;

/// All regulator devices in the system together with the rule registry and
/// the live I2C handles.
pub struct System {
    rules: Rules,
    chassis: Vec<Chassis>,
    handles: DeviceHandles,
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System").finish()
    }
}

impl System {
    pub fn new(rules: Rules, chassis: Vec<Chassis>, handles: DeviceHandles) -> Self {
        Self {
            rules,
            chassis,
            handles,
        }
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn chassis(&self) -> &[Chassis] {
        &self.chassis
    }

    pub fn handles_mut(&mut self) -> &mut DeviceHandles {
        &mut self.handles
    }

    /// Configures every device in the system. Called when the system is
    /// powered on and once at daemon startup.
    pub fn configure(&mut self, services: &mut dyn Services) {
        services.log_info("Configuring system");
        for chassis in &mut self.chassis {
            chassis.configure(&self.rules, &mut self.handles, services);
        }
    }

    /// Runs one sensor monitoring cycle across all rails.
    ///
    /// Per-rail failures mark that rail's sensors and are deduplicated by
    /// error kind within this pass.
    pub fn monitor_sensors(&mut self, services: &mut dyn Services) {
        let mut history = ErrorHistory::new();
        services.sensors().start_cycle();
        for chassis in &mut self.chassis {
            chassis.monitor_sensors(&self.rules, &mut self.handles, services, &mut history);
        }
        services.sensors().end_cycle();
    }

    /// Clears cached hardware data, forcing the next pass to re-read it.
    pub fn clear_caches(&mut self) {
        for chassis in &mut self.chassis {
            for device in chassis.devices_mut() {
                device.clear_cache();
            }
        }
    }

    /// Closes all device I2C interfaces. Called when the system powers off.
    pub fn close_devices(&mut self, services: &mut dyn Services) {
        for chassis in &mut self.chassis {
            chassis.close_devices(&mut self.handles, services);
        }
    }
}
