//! Chassis state machine.

use crate::device::PowerSequencerDevice;
use crate::Error;
use services::{AdditionalData, ChassisStatusMonitor, MonitorOptions, Services};
use std::time::Duration;
use types::{PowerGood, PowerState};

/// Default power good timeout for a chassis power state change.
pub const DEFAULT_PGOOD_TIMEOUT: Duration = Duration::from_secs(10);

/// A chassis within the system: a physical enclosure containing power
/// sequencer devices along with the components they power.
///
/// Chassis numbers start at 1; chassis 0 represents the entire system.
pub struct Chassis {
    number: usize,
    inventory_path: String,
    devices: Vec<Box<dyn PowerSequencerDevice>>,
    monitor_options: MonitorOptions,
    status_monitor: Option<Box<dyn ChassisStatusMonitor>>,
    power_state: Option<PowerState>,
    power_good: Option<PowerGood>,
    pgood_timeout: Duration,
}

impl std::fmt::Debug for Chassis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chassis").finish()
    }
}

impl Chassis {
    pub fn new(
        number: usize,
        inventory_path: &str,
        devices: Vec<Box<dyn PowerSequencerDevice>>,
        monitor_options: MonitorOptions,
    ) -> Self {
        // This application owns the power state and power good properties,
        // so monitoring them would be self-referential.
        let monitor_options =
            monitor_options & !(MonitorOptions::POWER_STATE | MonitorOptions::POWER_GOOD);
        Self {
            number,
            inventory_path: inventory_path.to_string(),
            devices,
            monitor_options,
            status_monitor: None,
            power_state: None,
            power_good: None,
            pgood_timeout: DEFAULT_PGOOD_TIMEOUT,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn inventory_path(&self) -> &str {
        &self.inventory_path
    }

    pub fn devices(&self) -> &[Box<dyn PowerSequencerDevice>] {
        &self.devices
    }

    pub fn monitor_options(&self) -> MonitorOptions {
        self.monitor_options
    }

    pub fn pgood_timeout(&self) -> Duration {
        self.pgood_timeout
    }

    /// Sets the power good timeout. A change during a power state change
    /// takes effect on the next one.
    pub fn set_pgood_timeout(&mut self, timeout: Duration) {
        self.pgood_timeout = timeout;
    }

    /// Creates the status monitor. Must be called before any method that
    /// checks chassis status. Replaces any previous monitor.
    pub fn initialize_monitoring(&mut self, services: &mut dyn Services) {
        self.status_monitor = Some(services.create_status_monitor(
            self.number,
            &self.inventory_path,
            self.monitor_options,
        ));
    }

    fn status_monitor(&self) -> Result<&dyn ChassisStatusMonitor, Error> {
        self.status_monitor
            .as_deref()
            .ok_or(Error::MonitoringNotInitialized(self.number))
    }

    pub fn is_present(&self) -> Result<bool, Error> {
        self.status_monitor()?
            .is_present()
            .map_err(|e| Error::failed(e.to_string()))
    }

    /// Whether communication with the chassis is possible at all.
    pub fn is_available(&self) -> Result<bool, Error> {
        self.status_monitor()?
            .is_available()
            .map_err(|e| Error::failed(e.to_string()))
    }

    /// False when the chassis has been put in hardware isolation.
    pub fn is_enabled(&self) -> Result<bool, Error> {
        self.status_monitor()?
            .is_enabled()
            .map_err(|e| Error::failed(e.to_string()))
    }

    pub fn is_input_power_good(&self) -> Result<bool, Error> {
        self.status_monitor()?
            .is_input_power_good()
            .map_err(|e| Error::failed(e.to_string()))
    }

    pub fn is_power_supplies_power_good(&self) -> Result<bool, Error> {
        self.status_monitor()?
            .is_power_supplies_power_good()
            .map_err(|e| Error::failed(e.to_string()))
    }

    /// Last requested power state. Set by `monitor` on startup and by
    /// `set_power_state` afterwards.
    pub fn power_state(&self) -> Result<PowerState, Error> {
        self.power_state
            .ok_or(Error::ChassisPowerStateUnknown(self.number))
    }

    /// Combined power good of all sequencer devices. Read by `monitor`.
    pub fn power_good(&self) -> Result<PowerGood, Error> {
        self.power_good
            .ok_or(Error::ChassisPowerGoodUnknown(self.number))
    }

    /// Whether the chassis can be moved to the given power state, with the
    /// reason when it cannot.
    ///
    /// Available is checked last: that property is derived from a list of
    /// factors including some of the preceding checks.
    pub fn can_set_power_state(&self, new_state: PowerState) -> (bool, String) {
        if self.status_monitor.is_none() {
            return (
                false,
                Error::MonitoringNotInitialized(self.number).to_string(),
            );
        }

        let result = (|| -> Result<Option<&'static str>, Error> {
            if self.power_state == Some(new_state) {
                return Ok(Some("Chassis is already at requested state"));
            }
            if !self.is_present()? {
                return Ok(Some("Chassis is not present"));
            }
            // Power on is not allowed for chassis in hardware isolation;
            // power off always is.
            if !self.is_enabled()? && new_state == PowerState::On {
                return Ok(Some("Chassis is not enabled"));
            }
            if !self.is_input_power_good()? {
                return Ok(Some("Chassis does not have input power"));
            }
            if !self.is_available()? {
                return Ok(Some("Chassis is not available"));
            }
            Ok(None)
        })();

        match result {
            Ok(None) => (true, String::new()),
            Ok(Some(reason)) => (false, reason.to_string()),
            Err(e) => (false, format!("Error determining chassis status: {e}")),
        }
    }

    /// Powers the chassis on or off.
    pub fn set_power_state(
        &mut self,
        new_state: PowerState,
        services: &mut dyn Services,
    ) -> Result<(), Error> {
        self.status_monitor()?;
        let (can_set, reason) = self.can_set_power_state(new_state);
        if !can_set {
            return Err(Error::failed(format!(
                "Unable to set chassis {} to state {new_state}: {reason}",
                self.number
            )));
        }

        self.power_state = Some(new_state);
        match new_state {
            PowerState::On => self.power_on(services),
            PowerState::Off => self.power_off(services),
        }
    }

    /// Monitors the chassis status. Must be called periodically.
    pub fn monitor(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        self.status_monitor()?;

        if !self.is_present()? || !self.is_input_power_good()? {
            self.power_state = Some(PowerState::Off);
            self.power_good = Some(PowerGood::Off);
            self.close_devices();
            return Ok(());
        }

        if self.is_present()? && self.is_available()? && self.is_input_power_good()? {
            self.read_power_good(services);
            self.set_initial_power_state_if_needed();
        }
        Ok(())
    }

    /// Closes all open devices. Never fails: the chassis may have gone
    /// missing or lost input power, but the file handles still need to be
    /// released.
    pub fn close_devices(&mut self) {
        for device in &mut self.devices {
            if device.is_open() {
                device.close();
            }
        }
    }

    /// Runs pgood fault detection across the chassis devices, returning the
    /// first identified error name.
    pub fn find_pgood_fault(
        &mut self,
        services: &mut dyn Services,
        power_supply_error: &str,
        additional_data: &mut AdditionalData,
    ) -> Result<String, Error> {
        for device in &mut self.devices {
            if !device.is_open() {
                device.open(services)?;
            }
            let error = device.find_pgood_fault(services, power_supply_error, additional_data)?;
            if !error.is_empty() {
                return Ok(error);
            }
        }
        Ok(String::new())
    }

    /// Reads the power good value from every device and derives the chassis
    /// value.
    ///
    /// The chassis value only changes when all devices agree; a mixed
    /// reading keeps the previous value, debouncing device disagreement
    /// during transitions.
    fn read_power_good(&mut self, services: &mut dyn Services) {
        let mut on_count = 0;
        let mut off_count = 0;
        for device in &mut self.devices {
            let result = (|| -> Result<bool, Error> {
                if !device.is_open() {
                    device.open(services)?;
                }
                device.power_good(services)
            })();
            match result {
                Ok(true) => on_count += 1,
                Ok(false) => off_count += 1,
                Err(_) => {}
            }
        }

        if on_count == self.devices.len() {
            self.power_good = Some(PowerGood::On);
        } else if off_count == self.devices.len() {
            self.power_good = Some(PowerGood::Off);
        }
    }

    /// One-shot inference at startup: with no requested state recorded yet,
    /// assume the last request matched the observed power good value.
    fn set_initial_power_state_if_needed(&mut self) {
        if self.power_state.is_none() {
            if let Some(power_good) = self.power_good {
                self.power_state = Some(match power_good {
                    PowerGood::On => PowerState::On,
                    PowerGood::Off => PowerState::Off,
                });
            }
        }
    }

    fn power_on(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        let mut error = String::new();
        for device in &mut self.devices {
            // Remember the failure but keep going so the remaining devices
            // still power on.
            let result = (|| -> Result<(), Error> {
                if !device.is_open() {
                    device.open(services)?;
                }
                device.power_on(services)
            })();
            if let Err(e) = result {
                error = format!(
                    "Unable to power on device {} in chassis {}: {e}",
                    device.name(),
                    self.number
                );
            }
        }

        if !error.is_empty() {
            return Err(Error::failed(error));
        }
        Ok(())
    }

    fn power_off(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        let mut error = String::new();
        for device in &mut self.devices {
            let result = (|| -> Result<(), Error> {
                if !device.is_open() {
                    device.open(services)?;
                }
                device.power_off(services)
            })();
            if let Err(e) = result {
                error = format!(
                    "Unable to power off device {} in chassis {}: {e}",
                    device.name(),
                    self.number
                );
            }
        }

        if !error.is_empty() {
            return Err(Error::failed(error));
        }
        Ok(())
    }
}
