//! A hardware device described in the regulators configuration.

use crate::action::Action;
use crate::environment::{ActionEnvironment, DeviceHandles};
use crate::error_logging::{self, ErrorHistory};
use crate::rail::Rail;
use crate::rule::{execute_actions, Rules};
use services::Services;
use types::Severity;

/// Presence detection for a device.
///
/// The result is cached so the actions run at most once per pass; devices
/// that are not present are skipped by configuration and monitoring.
pub struct PresenceDetection {
    actions: Vec<Action>,
    present: Option<bool>,
}

impl PresenceDetection {
    pub fn new(actions: Vec<Action>) -> Self {
        Self {
            actions,
            present: None,
        }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Executes the presence detection actions, if not already cached.
    ///
    /// An execution error is logged and the device is assumed present so a
    /// transient failure cannot leave hardware unconfigured.
    pub fn execute(
        &mut self,
        device_id: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) -> bool {
        if let Some(present) = self.present {
            return present;
        }

        let mut env = ActionEnvironment::new(rules, handles, device_id, services);
        let present = match execute_actions(&self.actions, &mut env) {
            Ok(present) => present,
            Err(e) => {
                services.log_error(&format!(
                    "Unable to determine presence of {device_id}: {e}"
                ));
                let mut history = ErrorHistory::new();
                error_logging::log_error(&e, Severity::Warning, services, &mut history);
                true
            }
        };
        self.present = Some(present);
        present
    }

    /// Clears the cached result so the next execute runs the actions again.
    pub fn clear_cache(&mut self) {
        self.present = None;
    }
}

/// Configuration changes applied to a device or rail.
pub struct Configuration {
    volts: Option<f64>,
    actions: Vec<Action>,
}

impl Configuration {
    pub fn new(volts: Option<f64>, actions: Vec<Action>) -> Self {
        Self { volts, actions }
    }

    pub fn volts(&self) -> Option<f64> {
        self.volts
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Executes the configuration actions.
    ///
    /// Errors are logged and swallowed; a bad register write on one device
    /// must not stop the remaining devices from being configured.
    pub fn execute(
        &self,
        device_id: &str,
        target_name: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) {
        match self.volts {
            Some(volts) => {
                services.log_info(&format!("Configuring {target_name}: volts={volts}"))
            }
            None => services.log_info(&format!("Configuring {target_name}")),
        }

        let mut env = ActionEnvironment::new(rules, handles, device_id, services);
        if let Some(volts) = self.volts {
            env.set_volts(volts);
        }
        if let Err(e) = execute_actions(&self.actions, &mut env) {
            services.log_error(&format!("Unable to configure {target_name}: {e}"));
            let mut history = ErrorHistory::new();
            error_logging::log_error(&e, Severity::Error, services, &mut history);
        }
    }
}

/// A device within the chassis: a voltage regulator or another device that
/// actions need to reach over I2C.
pub struct Device {
    id: String,
    is_regulator: bool,
    fru: String,
    presence_detection: Option<PresenceDetection>,
    configuration: Option<Configuration>,
    rails: Vec<Rail>,
}

impl Device {
    pub fn new(
        id: &str,
        is_regulator: bool,
        fru: &str,
        presence_detection: Option<PresenceDetection>,
        configuration: Option<Configuration>,
        rails: Vec<Rail>,
    ) -> Self {
        Self {
            id: id.to_string(),
            is_regulator,
            fru: fru.to_string(),
            presence_detection,
            configuration,
            rails,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_regulator(&self) -> bool {
        self.is_regulator
    }

    pub fn fru(&self) -> &str {
        &self.fru
    }

    pub fn rails(&self) -> &[Rail] {
        &self.rails
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub fn presence_detection(&self) -> Option<&PresenceDetection> {
        self.presence_detection.as_ref()
    }

    /// Whether the device is present. Devices without presence detection are
    /// always present.
    pub fn is_present(
        &mut self,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) -> bool {
        match &mut self.presence_detection {
            Some(detection) => detection.execute(&self.id, rules, handles, services),
            None => true,
        }
    }

    /// Clears cached data so the next pass re-reads the hardware state.
    pub fn clear_cache(&mut self) {
        if let Some(detection) = &mut self.presence_detection {
            detection.clear_cache();
        }
    }

    /// Configures the device and its rails.
    pub fn configure(
        &mut self,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) {
        if !self.is_present(rules, handles, services) {
            services.log_info(&format!("Device {} is not present", self.id));
            return;
        }

        if let Some(configuration) = &self.configuration {
            configuration.execute(&self.id, &self.id, rules, handles, services);
        }
        for rail in &self.rails {
            rail.configure(&self.id, rules, handles, services);
        }
    }

    /// Reads and publishes the sensors of every rail.
    pub fn monitor_sensors(
        &mut self,
        chassis_inventory_path: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
        history: &mut ErrorHistory,
    ) {
        if !self.is_present(rules, handles, services) {
            return;
        }

        let fru = self.fru.clone();
        for rail in &self.rails {
            rail.monitor_sensors(
                &self.id,
                &fru,
                chassis_inventory_path,
                rules,
                handles,
                services,
                history,
            );
        }
    }

    /// Closes the device's I2C interface.
    pub fn close(&mut self, handles: &mut DeviceHandles) {
        handles.close(&self.id);
    }
}
