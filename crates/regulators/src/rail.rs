//! A voltage rail produced by a regulator.

use crate::action::Action;
use crate::device::Configuration;
use crate::environment::{ActionEnvironment, DeviceHandles};
use crate::error_logging::{self, ErrorHistory};
use crate::rule::{execute_actions, Rules};
use services::Services;
use types::Severity;

/// Sensor monitoring for one rail: the actions that read the rail's sensor
/// values, executed once per monitoring cycle.
pub struct SensorMonitoring {
    actions: Vec<Action>,
}

impl SensorMonitoring {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Executes the sensor monitoring actions between `start_rail` and
    /// `end_rail`. Errors mark the rail's sensors non-functional but do not
    /// stop the monitoring cycle.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        rail_id: &str,
        device_id: &str,
        device_inventory_path: &str,
        chassis_inventory_path: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
        history: &mut ErrorHistory,
    ) {
        services
            .sensors()
            .start_rail(rail_id, device_inventory_path, chassis_inventory_path);

        let mut error_occurred = false;
        let mut env = ActionEnvironment::new(rules, handles, device_id, services);
        if let Err(e) = execute_actions(&self.actions, &mut env) {
            error_occurred = true;
            services.log_error(&format!("Unable to monitor sensors for rail {rail_id}: {e}"));
            error_logging::log_error(&e, Severity::Warning, services, history);
        }

        services.sensors().end_rail(error_occurred);
    }
}

/// A voltage rail and the configuration and monitoring behavior attached to
/// it.
pub struct Rail {
    id: String,
    configuration: Option<Configuration>,
    sensor_monitoring: Option<SensorMonitoring>,
}

impl Rail {
    pub fn new(
        id: &str,
        configuration: Option<Configuration>,
        sensor_monitoring: Option<SensorMonitoring>,
    ) -> Self {
        Self {
            id: id.to_string(),
            configuration,
            sensor_monitoring,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub fn sensor_monitoring(&self) -> Option<&SensorMonitoring> {
        self.sensor_monitoring.as_ref()
    }

    /// Applies the rail's configuration, if any.
    pub fn configure(
        &self,
        device_id: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
    ) {
        if let Some(configuration) = &self.configuration {
            configuration.execute(device_id, &self.id, rules, handles, services);
        }
    }

    /// Reads and publishes the rail's sensors, if it has sensor monitoring.
    #[allow(clippy::too_many_arguments)]
    pub fn monitor_sensors(
        &self,
        device_id: &str,
        device_inventory_path: &str,
        chassis_inventory_path: &str,
        rules: &Rules,
        handles: &mut DeviceHandles,
        services: &mut dyn Services,
        history: &mut ErrorHistory,
    ) {
        if let Some(monitoring) = &self.sensor_monitoring {
            monitoring.execute(
                &self.id,
                device_id,
                device_inventory_path,
                chassis_inventory_path,
                rules,
                handles,
                services,
                history,
            );
        }
    }
}
