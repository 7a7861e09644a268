//! Services implementation backed by the host BMC.
//!
//! Journal messages go to tracing, error events to the logging service over
//! D-Bus, presence and VPD to the inventory, and GPIO access to the
//! character-device interface.

use crate::{
    gpio, AdditionalData, ChassisStatusMonitor, MonitorOptions, Services, ServicesError,
};
use pmbus::{Pmbus, SysfsPmbus};
use sensors::{RailSensors, Sensors};
use tracing::{error, info};
use types::Severity;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::ObjectPath;

const MAPPER_SERVICE: &str = "xyz.openbmc_project.ObjectMapper";
const MAPPER_PATH: &str = "/xyz/openbmc_project/object_mapper";
const MAPPER_IFACE: &str = "xyz.openbmc_project.ObjectMapper";

const INVENTORY_ITEM_IFACE: &str = "xyz.openbmc_project.Inventory.Item";
const AVAILABILITY_IFACE: &str = "xyz.openbmc_project.State.Decorator.Availability";
const ENABLE_IFACE: &str = "xyz.openbmc_project.Object.Enable";

const LOGGING_SERVICE: &str = "xyz.openbmc_project.Logging";
const LOGGING_PATH: &str = "/xyz/openbmc_project/logging";
const LOGGING_CREATE_IFACE: &str = "xyz.openbmc_project.Logging.Create";

fn severity_string(severity: Severity) -> &'static str {
    match severity {
        Severity::Informational => "xyz.openbmc_project.Logging.Entry.Level.Informational",
        Severity::Warning => "xyz.openbmc_project.Logging.Entry.Level.Warning",
        Severity::Error => "xyz.openbmc_project.Logging.Entry.Level.Error",
        Severity::Critical => "xyz.openbmc_project.Logging.Entry.Level.Critical",
    }
}

fn dbus_error(e: impl ToString) -> ServicesError {
    ServicesError::DBus(e.to_string())
}

/// Resolves the service owning an inventory path.
fn get_service(
    connection: &Connection,
    path: &str,
    interface: &str,
) -> Result<String, ServicesError> {
    let proxy = Proxy::new(connection, MAPPER_SERVICE, MAPPER_PATH, MAPPER_IFACE)
        .map_err(dbus_error)?;
    let object_path = ObjectPath::try_from(path).map_err(dbus_error)?;
    let result: std::collections::HashMap<String, Vec<String>> = proxy
        .call("GetObject", &(object_path, vec![interface]))
        .map_err(dbus_error)?;
    result
        .into_keys()
        .next()
        .ok_or_else(|| ServicesError::DBus(format!("no service implements {interface} at {path}")))
}

fn get_bool_property(
    connection: &Connection,
    path: &str,
    interface: &str,
    property: &str,
) -> Result<bool, ServicesError> {
    let service = get_service(connection, path, interface)?;
    let proxy = Proxy::new(connection, service.as_str(), path, interface).map_err(dbus_error)?;
    proxy.get_property::<bool>(property).map_err(dbus_error)
}

/// [`Services`] implementation using the host BMC services.
pub struct HostServices {
    connection: Connection,
    sensors: RailSensors,
}

impl HostServices {
    pub fn new() -> Result<Self, ServicesError> {
        let connection = Connection::system().map_err(dbus_error)?;
        Ok(Self {
            connection,
            sensors: RailSensors::new(),
        })
    }

    pub fn rail_sensors(&self) -> &RailSensors {
        &self.sensors
    }
}

impl Services for HostServices {
    fn log_info(&mut self, message: &str) {
        info!("{message}");
    }

    fn log_error(&mut self, message: &str) {
        error!("{message}");
    }

    fn log_event(&mut self, message: &str, severity: Severity, additional_data: AdditionalData) {
        let mut additional_data = additional_data;
        additional_data.insert("_PID".to_string(), std::process::id().to_string());
        if severity == Severity::Critical {
            additional_data.insert("SEVERITY_DETAIL".to_string(), "SYSTEM_TERM".to_string());
        }

        let result = Proxy::new(
            &self.connection,
            LOGGING_SERVICE,
            LOGGING_PATH,
            LOGGING_CREATE_IFACE,
        )
        .and_then(|proxy| {
            proxy.call::<_, _, ()>(
                "Create",
                &(message, severity_string(severity), &additional_data),
            )
        });
        if let Err(e) = result {
            error!(message, "Unable to log error: {e}");
        }
    }

    fn is_present(&mut self, inventory_path: &str) -> Result<bool, ServicesError> {
        match get_bool_property(
            &self.connection,
            inventory_path,
            INVENTORY_ITEM_IFACE,
            "Present",
        ) {
            Ok(present) => Ok(present),
            // An unmapped path means the hardware was never added to the
            // inventory, which reads as not present.
            Err(ServicesError::DBus(description))
                if description.contains("no service implements") =>
            {
                Ok(false)
            }
            Err(e) => Err(ServicesError::Presence {
                inventory_path: inventory_path.to_string(),
                description: e.to_string(),
            }),
        }
    }

    fn gpio_values(&mut self, chip_label: &str) -> Result<Vec<u8>, ServicesError> {
        gpio::read_chip_values(chip_label)
    }

    fn read_gpio(&mut self, line_name: &str) -> Result<u8, ServicesError> {
        gpio::read_line(line_name)
    }

    fn set_gpio(&mut self, line_name: &str, value: u8) -> Result<(), ServicesError> {
        gpio::set_line(line_name, value)
    }

    fn vpd_value(
        &mut self,
        inventory_path: &str,
        keyword: &str,
    ) -> Result<Vec<u8>, ServicesError> {
        // VPD keywords are exposed as byte-array properties on the inventory
        // object's VINI record interface.
        let result: Result<Vec<u8>, ServicesError> = (|| {
            let interface = "com.ibm.ipzvpd.VINI";
            let service = get_service(&self.connection, inventory_path, interface)?;
            let proxy = Proxy::new(&self.connection, service.as_str(), inventory_path, interface)
                .map_err(dbus_error)?;
            proxy.get_property::<Vec<u8>>(keyword).map_err(dbus_error)
        })();
        result.map_err(|e| ServicesError::Vpd {
            inventory_path: inventory_path.to_string(),
            keyword: keyword.to_string(),
            description: e.to_string(),
        })
    }

    fn create_pmbus(
        &mut self,
        bus: u8,
        address: u16,
        driver_name: &str,
        instance: usize,
    ) -> Box<dyn Pmbus> {
        Box::new(SysfsPmbus::new(bus, address, driver_name, instance))
    }

    fn create_status_monitor(
        &mut self,
        chassis_number: usize,
        inventory_path: &str,
        options: MonitorOptions,
    ) -> Box<dyn ChassisStatusMonitor> {
        Box::new(HostStatusMonitor {
            connection: self.connection.clone(),
            chassis_number,
            inventory_path: inventory_path.to_string(),
            options,
        })
    }

    fn sensors(&mut self) -> &mut dyn Sensors {
        &mut self.sensors
    }
}

/// Status monitor reading chassis properties from the host inventory.
///
/// Properties that are not monitored report their safe default.
struct HostStatusMonitor {
    connection: Connection,
    chassis_number: usize,
    inventory_path: String,
    options: MonitorOptions,
}

impl ChassisStatusMonitor for HostStatusMonitor {
    fn chassis_number(&self) -> usize {
        self.chassis_number
    }

    fn is_present(&self) -> Result<bool, ServicesError> {
        if !self.options.contains(MonitorOptions::PRESENCE) {
            return Ok(true);
        }
        get_bool_property(
            &self.connection,
            &self.inventory_path,
            INVENTORY_ITEM_IFACE,
            "Present",
        )
    }

    fn is_available(&self) -> Result<bool, ServicesError> {
        if !self.options.contains(MonitorOptions::AVAILABILITY) {
            return Ok(true);
        }
        get_bool_property(
            &self.connection,
            &self.inventory_path,
            AVAILABILITY_IFACE,
            "Available",
        )
    }

    fn is_enabled(&self) -> Result<bool, ServicesError> {
        get_bool_property(
            &self.connection,
            &self.inventory_path,
            ENABLE_IFACE,
            "Enabled",
        )
        .or(Ok(true))
    }

    fn is_input_power_good(&self) -> Result<bool, ServicesError> {
        if !self.options.contains(MonitorOptions::INPUT_POWER) {
            return Ok(true);
        }
        get_bool_property(
            &self.connection,
            &self.inventory_path,
            "xyz.openbmc_project.State.Decorator.PowerSystemInputs",
            "Status",
        )
    }

    fn is_power_supplies_power_good(&self) -> Result<bool, ServicesError> {
        if !self.options.contains(MonitorOptions::POWER_SUPPLY_POWER) {
            return Ok(true);
        }
        get_bool_property(
            &self.connection,
            &self.inventory_path,
            "xyz.openbmc_project.State.Decorator.PowerState",
            "PowerGood",
        )
    }
}
