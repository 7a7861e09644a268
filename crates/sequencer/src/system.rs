//! System state machine.

use crate::chassis::Chassis;
use crate::Error;
use services::{AdditionalData, Services};
use std::collections::BTreeSet;
use std::time::Duration;
use types::{PowerGood, PowerState};

/// The computer system being controlled and monitored by the BMC.
pub struct System {
    chassis: Vec<Chassis>,
    monitoring_initialized: bool,
    power_state: Option<PowerState>,
    power_good: Option<PowerGood>,
    /// Chassis numbers selected for the current power on/off attempt.
    selected_chassis: BTreeSet<usize>,
}

impl System {
    pub fn new(chassis: Vec<Chassis>) -> Self {
        Self {
            chassis,
            monitoring_initialized: false,
            power_state: None,
            power_good: None,
            selected_chassis: BTreeSet::new(),
        }
    }

    pub fn chassis(&self) -> &[Chassis] {
        &self.chassis
    }

    pub fn chassis_mut(&mut self) -> &mut [Chassis] {
        &mut self.chassis
    }

    pub fn selected_chassis(&self) -> &BTreeSet<usize> {
        &self.selected_chassis
    }

    /// Initializes status monitoring in all chassis. Must be called before
    /// any method that checks system status.
    pub fn initialize_monitoring(&mut self, services: &mut dyn Services) {
        for chassis in &mut self.chassis {
            chassis.initialize_monitoring(services);
        }
        self.monitoring_initialized = true;
    }

    fn verify_monitoring_initialized(&self) -> Result<(), Error> {
        if !self.monitoring_initialized {
            return Err(Error::SystemMonitoringNotInitialized);
        }
        Ok(())
    }

    /// Last requested system power state. The initial value is inferred by
    /// `monitor`.
    pub fn power_state(&self) -> Result<PowerState, Error> {
        self.power_state.ok_or(Error::SystemPowerStateUnknown)
    }

    /// System power good, derived from the selected chassis by `monitor`.
    pub fn power_good(&self) -> Result<PowerGood, Error> {
        self.power_good.ok_or(Error::SystemPowerGoodUnknown)
    }

    /// Sets the power good timeout for all chassis.
    pub fn set_pgood_timeout(&mut self, timeout: Duration) {
        for chassis in &mut self.chassis {
            chassis.set_pgood_timeout(timeout);
        }
    }

    /// Powers the system on or off.
    ///
    /// The chassis that can be set to the new state become the selected set;
    /// a failure in one selected chassis is logged and does not stop the
    /// remaining chassis from transitioning.
    pub fn set_power_state(
        &mut self,
        new_state: PowerState,
        services: &mut dyn Services,
    ) -> Result<(), Error> {
        self.verify_monitoring_initialized()?;
        if self.power_state == Some(new_state) {
            return Err(Error::failed(format!(
                "Unable to set system to state {new_state}: Already at requested state"
            )));
        }

        let chassis_to_set = self.chassis_for_new_power_state(new_state, services);
        if chassis_to_set.is_empty() {
            return Err(Error::failed(format!(
                "Unable to set system to state {new_state}: No chassis can be set to that state"
            )));
        }

        self.power_state = Some(new_state);
        self.selected_chassis = chassis_to_set;

        for chassis in &mut self.chassis {
            if !self.selected_chassis.contains(&chassis.number()) {
                continue;
            }
            if let Err(e) = chassis.set_power_state(new_state, services) {
                services.log_error(&format!(
                    "Unable to set chassis {} to state {new_state}: {e}",
                    chassis.number()
                ));
            }
        }
        Ok(())
    }

    /// Monitors the status of the system. Must be called periodically.
    ///
    /// All chassis are monitored, including those not selected for the
    /// current power on/off attempt, so every chassis reacts to presence
    /// and availability changes.
    pub fn monitor(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        self.verify_monitoring_initialized()?;

        for chassis in &mut self.chassis {
            if let Err(e) = chassis.monitor(services) {
                services.log_error(&format!(
                    "Unable to monitor chassis {}: {e}",
                    chassis.number()
                ));
            }
        }

        self.set_initial_selected_chassis_if_needed();
        self.set_power_good();
        self.set_initial_power_state_if_needed();
        Ok(())
    }

    /// Runs pgood fault detection across the selected chassis.
    pub fn find_pgood_fault(
        &mut self,
        services: &mut dyn Services,
        power_supply_error: &str,
        additional_data: &mut AdditionalData,
    ) -> Result<String, Error> {
        let selected = self.selected_chassis.clone();
        for chassis in &mut self.chassis {
            if !selected.contains(&chassis.number()) {
                continue;
            }
            let error = chassis.find_pgood_fault(services, power_supply_error, additional_data)?;
            if !error.is_empty() {
                return Ok(error);
            }
        }
        Ok(String::new())
    }

    fn chassis_for_new_power_state(
        &mut self,
        new_state: PowerState,
        services: &mut dyn Services,
    ) -> BTreeSet<usize> {
        let mut chassis_for_state = BTreeSet::new();
        for chassis in &self.chassis {
            let (can_set, reason) = chassis.can_set_power_state(new_state);
            if can_set {
                chassis_for_state.insert(chassis.number());
            } else {
                services.log_info(&format!(
                    "Unable to set chassis {} to state {new_state}: {reason}",
                    chassis.number()
                ));
            }
        }
        chassis_for_state
    }

    /// Defines the initial selected chassis set after daemon start.
    ///
    /// Which chassis were selected before the restart is unknown, so the set
    /// is inferred: if any chassis with valid status is powered on, the last
    /// request was presumably on and the powered-on set is adopted;
    /// otherwise the powered-off set is.
    fn set_initial_selected_chassis_if_needed(&mut self) {
        if !self.selected_chassis.is_empty() {
            return;
        }

        let mut chassis_on = BTreeSet::new();
        let mut chassis_off = BTreeSet::new();
        for chassis in &self.chassis {
            // Chassis with invalid status, such as not present, are ignored
            let status = (|| -> Result<(bool, PowerGood), Error> {
                let valid =
                    chassis.is_present()? && chassis.is_available()? && chassis.is_input_power_good()?;
                Ok((valid, chassis.power_good()?))
            })();
            if let Ok((true, power_good)) = status {
                if power_good == PowerGood::On {
                    chassis_on.insert(chassis.number());
                } else {
                    chassis_off.insert(chassis.number());
                }
            }
        }

        self.selected_chassis = if chassis_on.is_empty() {
            chassis_off
        } else {
            chassis_on
        };
    }

    /// Derives the system power good from the selected chassis: on iff all
    /// report on, off iff all report off, otherwise left unchanged.
    fn set_power_good(&mut self) {
        if self.selected_chassis.is_empty() {
            return;
        }

        let mut on_count = 0;
        let mut off_count = 0;
        for chassis in &self.chassis {
            if !self.selected_chassis.contains(&chassis.number()) {
                continue;
            }
            match chassis.power_good() {
                Ok(PowerGood::On) => on_count += 1,
                Ok(PowerGood::Off) => off_count += 1,
                Err(_) => {}
            }
        }

        if on_count == self.selected_chassis.len() {
            self.power_good = Some(PowerGood::On);
        } else if off_count == self.selected_chassis.len() {
            self.power_good = Some(PowerGood::Off);
        }
    }

    /// One-shot inference at startup, mirroring the chassis-level version.
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestDevice;
    use services::MonitorOptions;
    use sim::{SimChassisStatus, SimServices};
    use std::sync::atomic::Ordering;

    fn chassis(number: usize, devices: Vec<TestDevice>) -> Chassis {
        let boxed = devices
            .into_iter()
            .map(|d| Box::new(d) as Box<dyn crate::device::PowerSequencerDevice>)
            .collect();
        Chassis::new(
            number,
            &format!("/inv/chassis{number}"),
            boxed,
            MonitorOptions::all(),
        )
    }

    #[test]
    fn test_requires_monitoring_initialized() {
        let mut services = SimServices::new();
        let mut system = System::new(vec![chassis(1, vec![TestDevice::new("seq0", false)])]);
        assert!(system.monitor(&mut services).is_err());
        assert!(system
            .set_power_state(PowerState::On, &mut services)
            .is_err());
    }

    #[test]
    fn test_initial_selection_prefers_powered_on_chassis() {
        // Three chassis: 1 is powered on, 2 is powered off, 3 is absent.
        // The first monitor tick must select {1} and set power good on.
        let mut services = SimServices::new();
        services.set_chassis_status(
            3,
            SimChassisStatus {
                present: false,
                ..Default::default()
            },
        );
        let mut system = System::new(vec![
            chassis(1, vec![TestDevice::new("seq0", true)]),
            chassis(2, vec![TestDevice::new("seq1", false)]),
            chassis(3, vec![TestDevice::new("seq2", false)]),
        ]);
        system.initialize_monitoring(&mut services);

        system.monitor(&mut services).unwrap();
        assert_eq!(
            system.selected_chassis().iter().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(system.power_good().unwrap(), PowerGood::On);
        // Power state inferred from power good
        assert_eq!(system.power_state().unwrap(), PowerState::On);
    }

    #[test]
    fn test_initial_selection_with_everything_off() {
        let mut services = SimServices::new();
        let mut system = System::new(vec![
            chassis(1, vec![TestDevice::new("seq0", false)]),
            chassis(2, vec![TestDevice::new("seq1", false)]),
        ]);
        system.initialize_monitoring(&mut services);

        system.monitor(&mut services).unwrap();
        assert_eq!(
            system.selected_chassis().iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(system.power_good().unwrap(), PowerGood::Off);
        assert_eq!(system.power_state().unwrap(), PowerState::Off);
    }

    #[test]
    fn test_set_power_state_selects_eligible_chassis() {
        let mut services = SimServices::new();
        // Chassis 2 is in hardware isolation and cannot power on
        services.set_chassis_status(
            2,
            SimChassisStatus {
                enabled: false,
                ..Default::default()
            },
        );
        let device0 = TestDevice::new("seq0", false);
        let device1 = TestDevice::new("seq1", false);
        let mut system = System::new(vec![
            chassis(1, vec![device0.clone()]),
            chassis(2, vec![device1.clone()]),
        ]);
        system.initialize_monitoring(&mut services);
        system.monitor(&mut services).unwrap();

        system.set_power_state(PowerState::On, &mut services).unwrap();
        assert_eq!(system.power_state().unwrap(), PowerState::On);
        assert_eq!(
            system.selected_chassis().iter().copied().collect::<Vec<_>>(),
            vec![1]
        );
        assert_eq!(device0.power_on_count.load(Ordering::Relaxed), 1);
        assert_eq!(device1.power_on_count.load(Ordering::Relaxed), 0);
        assert!(services
            .info_messages()
            .iter()
            .any(|m| m.contains("Unable to set chassis 2") && m.contains("not enabled")));
    }

    #[test]
    fn test_set_power_state_rejected_when_no_chassis_eligible() {
        let mut services = SimServices::new();
        services.set_chassis_status(
            1,
            SimChassisStatus {
                present: false,
                ..Default::default()
            },
        );
        let mut system = System::new(vec![chassis(1, vec![TestDevice::new("seq0", false)])]);
        system.initialize_monitoring(&mut services);

        let err = system
            .set_power_state(PowerState::On, &mut services)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("No chassis can be set to that state"));
        // Nothing was committed
        assert!(system.power_state().is_err());
        assert!(system.selected_chassis().is_empty());
    }

    #[test]
    fn test_set_power_state_already_at_state() {
        let mut services = SimServices::new();
        let mut system = System::new(vec![chassis(1, vec![TestDevice::new("seq0", false)])]);
        system.initialize_monitoring(&mut services);
        system.monitor(&mut services).unwrap();
        assert_eq!(system.power_state().unwrap(), PowerState::Off);

        let err = system
            .set_power_state(PowerState::Off, &mut services)
            .unwrap_err();
        assert!(err.to_string().contains("Already at requested state"));
    }

    #[test]
    fn test_chassis_failure_does_not_block_others() {
        let mut services = SimServices::new();
        let failing = TestDevice::new("seq0", false);
        failing.fail_power_ops.store(true, Ordering::Relaxed);
        let healthy = TestDevice::new("seq1", false);
        let mut system = System::new(vec![
            chassis(1, vec![failing]),
            chassis(2, vec![healthy.clone()]),
        ]);
        system.initialize_monitoring(&mut services);
        system.monitor(&mut services).unwrap();

        // Both chassis are selected; chassis 1 fails but chassis 2 turns on
        system.set_power_state(PowerState::On, &mut services).unwrap();
        assert_eq!(
            system.selected_chassis().iter().copied().collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(healthy.power_on_count.load(Ordering::Relaxed), 1);
        assert!(services
            .error_messages()
            .iter()
            .any(|m| m.contains("Unable to set chassis 1")));
    }

    #[test]
    fn test_power_good_requires_all_selected_chassis() {
        let mut services = SimServices::new();
        let device0 = TestDevice::new("seq0", true);
        let device1 = TestDevice::new("seq1", true);
        let mut system = System::new(vec![
            chassis(1, vec![device0.clone()]),
            chassis(2, vec![device1.clone()]),
        ]);
        system.initialize_monitoring(&mut services);
        system.monitor(&mut services).unwrap();
        assert_eq!(system.power_good().unwrap(), PowerGood::On);

        // One selected chassis drops to off: mixed reading leaves the
        // system value unchanged
        device1.pgood.store(false, Ordering::Relaxed);
        system.monitor(&mut services).unwrap();
        assert_eq!(system.power_good().unwrap(), PowerGood::On);

        device0.pgood.store(false, Ordering::Relaxed);
        system.monitor(&mut services).unwrap();
        assert_eq!(system.power_good().unwrap(), PowerGood::Off);
    }

    #[test]
    fn test_monitor_swallows_chassis_errors() {
        let mut services = SimServices::new();
        services.set_chassis_status(
            1,
            SimChassisStatus {
                fail: Some("inventory timeout".to_string()),
                ..Default::default()
            },
        );
        let mut system = System::new(vec![
            chassis(1, vec![TestDevice::new("seq0", false)]),
            chassis(2, vec![TestDevice::new("seq1", false)]),
        ]);
        system.initialize_monitoring(&mut services);

        system.monitor(&mut services).unwrap();
        assert!(services
            .error_messages()
            .iter()
            .any(|m| m.contains("Unable to monitor chassis 1")));
        // Chassis 2 was still monitored and selected
        assert_eq!(
            system.selected_chassis().iter().copied().collect::<Vec<_>>(),
            vec![2]
        );
    }
}
