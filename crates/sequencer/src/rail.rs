//! A voltage rail enabled and monitored by a power sequencer device.

use crate::device::PowerSequencerDevice;
use crate::Error;
use pmbus::status_vout;
use services::{AdditionalData, Services};

/// GPIO that reports the pgood status of a rail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gpio {
    /// Line offset on the device's GPIO chip.
    pub line: u32,
    /// When true, the value 0 indicates a true pgood status.
    pub active_low: bool,
}

/// A voltage rail.
#[derive(Debug)]
pub struct Rail {
    name: String,
    presence: Option<String>,
    page: Option<u8>,
    is_power_supply_rail: bool,
    check_status_vout: bool,
    compare_voltage_to_limit: bool,
    gpio: Option<Gpio>,
}

impl Rail {
    /// Creates a rail description.
    ///
    /// A PMBus page is required when STATUS_VOUT checking or voltage
    /// comparison is enabled.
    pub fn new(
        name: &str,
        presence: Option<String>,
        page: Option<u8>,
        is_power_supply_rail: bool,
        check_status_vout: bool,
        compare_voltage_to_limit: bool,
        gpio: Option<Gpio>,
    ) -> Result<Self, Error> {
        if (check_status_vout || compare_voltage_to_limit) && page.is_none() {
            return Err(Error::failed(format!(
                "PMBus PAGE is required for rail {name}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            presence,
            page,
            is_power_supply_rail,
            check_status_vout,
            compare_voltage_to_limit,
            gpio,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn presence(&self) -> Option<&str> {
        self.presence.as_deref()
    }

    pub fn page(&self) -> Option<u8> {
        self.page
    }

    pub fn is_power_supply_rail(&self) -> bool {
        self.is_power_supply_rail
    }

    pub fn check_status_vout(&self) -> bool {
        self.check_status_vout
    }

    pub fn compare_voltage_to_limit(&self) -> bool {
        self.compare_voltage_to_limit
    }

    pub fn gpio(&self) -> Option<Gpio> {
        self.gpio
    }

    fn verify_has_page(&self) -> Result<u8, Error> {
        self.page
            .ok_or_else(|| Error::failed(format!("No PAGE number defined for rail {}", self.name)))
    }

    /// Whether the rail is present, based on its presence inventory path.
    ///
    /// A rail without a presence path is always present.
    pub fn is_present(&self, services: &mut dyn Services) -> Result<bool, Error> {
        let Some(inventory_path) = &self.presence else {
            return Ok(true);
        };
        services.is_present(inventory_path).map_err(|e| {
            Error::failed(format!(
                "Unable to determine presence of rail {} using inventory path {}: {e}",
                self.name, inventory_path
            ))
        })
    }

    pub fn status_word<D: PowerSequencerDevice + ?Sized>(&self, device: &D) -> Result<u16, Error> {
        let page = self.verify_has_page()?;
        device.status_word(page).map_err(|e| {
            Error::failed(format!(
                "Unable to read STATUS_WORD value for rail {}: {e}",
                self.name
            ))
        })
    }

    pub fn status_vout<D: PowerSequencerDevice + ?Sized>(&self, device: &D) -> Result<u8, Error> {
        let page = self.verify_has_page()?;
        device.status_vout(page).map_err(|e| {
            Error::failed(format!(
                "Unable to read STATUS_VOUT value for rail {}: {e}",
                self.name
            ))
        })
    }

    pub fn read_vout<D: PowerSequencerDevice + ?Sized>(&self, device: &D) -> Result<f64, Error> {
        let page = self.verify_has_page()?;
        device.read_vout(page).map_err(|e| {
            Error::failed(format!(
                "Unable to read READ_VOUT value for rail {}: {e}",
                self.name
            ))
        })
    }

    pub fn vout_uv_fault_limit<D: PowerSequencerDevice + ?Sized>(
        &self,
        device: &D,
    ) -> Result<f64, Error> {
        let page = self.verify_has_page()?;
        device.vout_uv_fault_limit(page).map_err(|e| {
            Error::failed(format!(
                "Unable to read VOUT_UV_FAULT_LIMIT value for rail {}: {e}",
                self.name
            ))
        })
    }

    /// Per-rail pgood fault check combining all evidence sources.
    ///
    /// Checks STATUS_VOUT first, then the GPIO, then the output voltage.
    /// A rail that is not present never has a pgood fault.
    pub fn has_pgood_fault<D: PowerSequencerDevice + ?Sized>(
        &self,
        device: &D,
        services: &mut dyn Services,
        gpio_values: &[u8],
        additional_data: &mut AdditionalData,
    ) -> Result<bool, Error> {
        if !self.is_present(services)? {
            services.log_info(&format!("Rail {} is not present", self.name));
            return Ok(false);
        }

        let mut has_fault = self.has_pgood_fault_status_vout(device, services, additional_data)?;
        if !has_fault {
            has_fault = self.has_pgood_fault_gpio(services, gpio_values, additional_data)?;
        }
        if !has_fault {
            has_fault = self.has_pgood_fault_output_voltage(device, services, additional_data)?;
        }

        if has_fault {
            services.log_error(&format!("Pgood fault detected in rail {}", self.name));
            self.store_pgood_fault_debug_data(device, services, additional_data);
        }
        Ok(has_fault)
    }

    /// Checks whether STATUS_VOUT indicates a pgood fault.
    ///
    /// The rail is faulted iff any bit outside the warning mask is set. Bits
    /// inside the warning mask produce an informational journal entry only.
    pub fn has_pgood_fault_status_vout<D: PowerSequencerDevice + ?Sized>(
        &self,
        device: &D,
        services: &mut dyn Services,
        additional_data: &mut AdditionalData,
    ) -> Result<bool, Error> {
        if !self.check_status_vout {
            return Ok(false);
        }

        let value = self.status_vout(device)?;
        if value & !status_vout::WARNING_MASK != 0 {
            services.log_error(&format!(
                "Rail {} has fault bits set in STATUS_VOUT: {value:#04x}",
                self.name
            ));
            additional_data.insert("STATUS_VOUT".to_string(), format!("{value:#04x}"));
            return Ok(true);
        }
        if value != 0 {
            services.log_info(&format!(
                "Rail {} has warning bits set in STATUS_VOUT: {value:#04x}",
                self.name
            ));
        }
        Ok(false)
    }

    /// Checks whether the rail's pgood GPIO reads inactive.
    pub fn has_pgood_fault_gpio(
        &self,
        services: &mut dyn Services,
        gpio_values: &[u8],
        additional_data: &mut AdditionalData,
    ) -> Result<bool, Error> {
        let Some(gpio) = self.gpio else {
            return Ok(false);
        };

        let line = gpio.line as usize;
        if line >= gpio_values.len() {
            return Err(Error::failed(format!(
                "Invalid GPIO line offset {} for rail {}: Device only has {} GPIO values",
                gpio.line,
                self.name,
                gpio_values.len()
            )));
        }
        let value = gpio_values[line];

        let inactive = (gpio.active_low && value == 1) || (!gpio.active_low && value == 0);
        if inactive {
            services.log_error(&format!(
                "Rail {} pgood GPIO line offset {} has inactive value {value}",
                self.name, gpio.line
            ));
            additional_data.insert("GPIO_LINE".to_string(), gpio.line.to_string());
            additional_data.insert("GPIO_VALUE".to_string(), value.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    /// Checks whether the output voltage is at or below the undervoltage
    /// fault limit.
    pub fn has_pgood_fault_output_voltage<D: PowerSequencerDevice + ?Sized>(
        &self,
        device: &D,
        services: &mut dyn Services,
        additional_data: &mut AdditionalData,
    ) -> Result<bool, Error> {
        if !self.compare_voltage_to_limit {
            return Ok(false);
        }

        let vout = self.read_vout(device)?;
        let uv_limit = self.vout_uv_fault_limit(device)?;
        if vout <= uv_limit {
            services.log_error(&format!(
                "Rail {} output voltage {vout}V is <= UV fault limit {uv_limit}V",
                self.name
            ));
            additional_data.insert("READ_VOUT".to_string(), vout.to_string());
            additional_data.insert("VOUT_UV_FAULT_LIMIT".to_string(), uv_limit.to_string());
            return Ok(true);
        }
        Ok(false)
    }

    /// Records the rail name and, best effort, STATUS_WORD.
    pub fn store_pgood_fault_debug_data<D: PowerSequencerDevice + ?Sized>(
        &self,
        device: &D,
        services: &mut dyn Services,
        additional_data: &mut AdditionalData,
    ) {
        additional_data.insert("RAIL_NAME".to_string(), self.name.clone());
        if self.page.is_some() {
            // STATUS_WORD is diagnostic only; a failed read must not
            // interrupt pgood fault handling.
            if let Ok(status_word) = self.status_word(device) {
                services.log_info(&format!(
                    "Rail {} STATUS_WORD: {status_word:#06x}",
                    self.name
                ));
                additional_data.insert("STATUS_WORD".to_string(), format!("{status_word:#06x}"));
            }
        }
    }
}
