//! Power sequencer devices.
//!
//! The UCD90160 and UCD90320 share one PMBus driver and differ mainly in
//! their GPIO pin maps, so the shared behavior lives in [`Ucd90x`] and the
//! two device types wrap it, adding their own GPIO formatting for fault
//! debug data.

use crate::rail::Rail;
use crate::Error;
use pmbus::{FileKind, Pmbus};
use regex::Regex;
use services::{AdditionalData, Services};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use types::format_list;

/// Error name logged when a rail-level pgood fault is identified.
pub const POWER_SEQUENCER_VOLTAGE_FAULT: &str =
    "xyz.openbmc_project.Power.Error.PowerSequencerVoltageFault";

/// A programmable power sequencer device.
pub trait PowerSequencerDevice: Send {
    fn name(&self) -> &str;

    /// Rails in power-on sequence order.
    fn rails(&self) -> &[Rail];

    fn is_open(&self) -> bool;
    fn open(&mut self, services: &mut dyn Services) -> Result<(), Error>;
    fn close(&mut self);

    /// Asserts the device's power enable.
    fn power_on(&mut self, services: &mut dyn Services) -> Result<(), Error>;

    /// Deasserts the device's power enable.
    fn power_off(&mut self, services: &mut dyn Services) -> Result<(), Error>;

    /// Reads the device's power-good signal.
    fn power_good(&mut self, services: &mut dyn Services) -> Result<bool, Error>;

    /// Reads all GPIO values from the device in one call.
    fn gpio_values(&self, services: &mut dyn Services) -> Result<Vec<u8>, Error>;

    fn status_word(&self, page: u8) -> Result<u16, Error>;
    fn status_vout(&self, page: u8) -> Result<u8, Error>;
    fn read_vout(&self, page: u8) -> Result<f64, Error>;
    fn vout_uv_fault_limit(&self, page: u8) -> Result<f64, Error>;

    /// Called once before fault detection so caches can be rebuilt.
    fn prepare_for_pgood_fault_detection(
        &mut self,
        services: &mut dyn Services,
    ) -> Result<(), Error> {
        let _ = services;
        Ok(())
    }

    /// Stores device-level debug data after a fault was identified. Must not
    /// fail; missing debug data must not interrupt fault handling.
    fn store_pgood_fault_debug_data(
        &self,
        services: &mut dyn Services,
        gpio_values: &[u8],
        additional_data: &mut AdditionalData,
    ) {
        additional_data.insert("DEVICE_NAME".to_string(), self.name().to_string());
        store_gpio_values_plain(self.name(), services, gpio_values, additional_data);
    }

    /// Identifies the rail with a pgood fault, if any.
    ///
    /// Returns the error name to log, or an empty string when no fault could
    /// be identified.
    fn find_pgood_fault(
        &mut self,
        services: &mut dyn Services,
        power_supply_error: &str,
        additional_data: &mut AdditionalData,
    ) -> Result<String, Error>;
}

/// Stores GPIO values as a plain integer list.
pub(crate) fn store_gpio_values_plain(
    device_name: &str,
    services: &mut dyn Services,
    values: &[u8],
    additional_data: &mut AdditionalData,
) {
    if !values.is_empty() {
        let values_str = format_list(values);
        services.log_info(&format!("Device {device_name} GPIO values: {values_str}"));
        additional_data.insert("GPIO_VALUES".to_string(), values_str);
    }
}

/// Standard pgood fault detection across a device's rails.
///
/// Pass A returns the first rail in power-on order whose STATUS_VOUT shows a
/// fault: when a downstream pgood loss makes the sequencer shut rails off,
/// STATUS_VOUT on the faulted rail is the most direct signal, while the
/// other rails merely look off. Pass B returns the first rail that is
/// pgood-inactive by GPIO or by output voltage versus the undervoltage
/// limit.
pub fn find_pgood_fault(
    device: &mut dyn PowerSequencerDevice,
    services: &mut dyn Services,
    power_supply_error: &str,
    additional_data: &mut AdditionalData,
) -> Result<String, Error> {
    let device_name = device.name().to_string();
    let result = (|| -> Result<String, Error> {
        device.prepare_for_pgood_fault_detection(services)?;

        // GPIO values may be slow to obtain; read them once for all rails.
        // An unreadable chip leaves the vector empty and disables the GPIO
        // checks only.
        let gpio_values = device.gpio_values(services).unwrap_or_default();

        let dev = &*device;
        let mut faulted: Option<&Rail> = None;
        for rail in dev.rails() {
            if rail.has_pgood_fault_status_vout(dev, services, additional_data)? {
                faulted = Some(rail);
                break;
            }
        }
        if faulted.is_none() {
            for rail in dev.rails() {
                if rail.has_pgood_fault_gpio(services, &gpio_values, additional_data)?
                    || rail.has_pgood_fault_output_voltage(dev, services, additional_data)?
                {
                    faulted = Some(rail);
                    break;
                }
            }
        }

        let Some(rail) = faulted else {
            return Ok(String::new());
        };

        services.log_error(&format!(
            "Pgood fault found in rail monitored by device {}",
            dev.name()
        ));
        rail.store_pgood_fault_debug_data(dev, services, additional_data);

        let error = if rail.is_power_supply_rail() && !power_supply_error.is_empty() {
            // A power supply fault shut this rail down; report that as the
            // root cause rather than the voltage fault.
            power_supply_error.to_string()
        } else {
            POWER_SEQUENCER_VOLTAGE_FAULT.to_string()
        };

        dev.store_pgood_fault_debug_data(services, &gpio_values, additional_data);
        Ok(error)
    })();

    result.map_err(|e| {
        Error::failed(format!(
            "Unable to determine if a pgood fault occurred in device {device_name}: {e}"
        ))
    })
}

fn label_file_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^in(\d+)_label$").unwrap())
}

fn label_contents_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^vout(\d+)$").unwrap())
}

/// Shared behavior of the UCD90X sequencer family.
///
/// These devices are bound to the common `ucd9000` PMBus driver, are powered
/// on and off through a named control GPIO, and report power good through a
/// named pgood GPIO.
pub struct Ucd90x {
    name: String,
    bus: u8,
    address: u16,
    power_control_gpio_name: String,
    power_good_gpio_name: String,
    rails: Vec<Rail>,
    pmbus: Box<dyn Pmbus>,
    page_to_file_number: BTreeMap<u8, u32>,
    open: bool,
}

impl Ucd90x {
    pub const DRIVER_NAME: &'static str = "ucd9000";

    pub fn new(
        name: &str,
        bus: u8,
        address: u16,
        power_control_gpio_name: &str,
        power_good_gpio_name: &str,
        rails: Vec<Rail>,
        services: &mut dyn Services,
    ) -> Self {
        let pmbus = services.create_pmbus(bus, address, Self::DRIVER_NAME, 0);
        Self {
            name: name.to_string(),
            bus,
            address,
            power_control_gpio_name: power_control_gpio_name.to_string(),
            power_good_gpio_name: power_good_gpio_name.to_string(),
            rails,
            pmbus,
            page_to_file_number: BTreeMap::new(),
            open: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    pub fn rails(&self) -> &[Rail] {
        &self.rails
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        services.log_info(&format!(
            "Opening device {} on bus {} address {:#04x}",
            self.name, self.bus, self.address
        ));
        self.open = true;
        Ok(())
    }

    pub fn close(&mut self) {
        self.open = false;
        self.page_to_file_number.clear();
    }

    pub fn power_on(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        services
            .set_gpio(&self.power_control_gpio_name, 1)
            .map_err(|e| {
                Error::failed(format!("Unable to power on device {}: {e}", self.name))
            })
    }

    pub fn power_off(&mut self, services: &mut dyn Services) -> Result<(), Error> {
        services
            .set_gpio(&self.power_control_gpio_name, 0)
            .map_err(|e| {
                Error::failed(format!("Unable to power off device {}: {e}", self.name))
            })
    }

    pub fn power_good(&mut self, services: &mut dyn Services) -> Result<bool, Error> {
        let value = services
            .read_gpio(&self.power_good_gpio_name)
            .map_err(|e| {
                Error::failed(format!(
                    "Unable to read power good for device {}: {e}",
                    self.name
                ))
            })?;
        Ok(value == 1)
    }

    /// Reads all GPIO values using the lower-cased device name as the chip
    /// label.
    pub fn gpio_values(&self, services: &mut dyn Services) -> Result<Vec<u8>, Error> {
        let label = self.name.to_lowercase();
        services.gpio_values(&label).map_err(|e| {
            Error::failed(format!(
                "Unable to read GPIO values from device {} using label {label}: {e}",
                self.name
            ))
        })
    }

    pub fn status_word(&self, page: u8) -> Result<u16, Error> {
        self.pmbus
            .read(&format!("status{page}"), FileKind::Debug)
            .map(|value| value as u16)
            .map_err(|e| {
                Error::failed(format!(
                    "Unable to read STATUS_WORD for PAGE {page} of device {}: {e}",
                    self.name
                ))
            })
    }

    pub fn status_vout(&self, page: u8) -> Result<u8, Error> {
        self.pmbus
            .read(&format!("status{page}_vout"), FileKind::Debug)
            .map(|value| value as u8)
            .map_err(|e| {
                Error::failed(format!(
                    "Unable to read STATUS_VOUT for PAGE {page} of device {}: {e}",
                    self.name
                ))
            })
    }

    pub fn read_vout(&self, page: u8) -> Result<f64, Error> {
        let file_number = self.file_number(page)?;
        self.read_millivolts(&format!("in{file_number}_input"), page)
    }

    pub fn vout_uv_fault_limit(&self, page: u8) -> Result<f64, Error> {
        let file_number = self.file_number(page)?;
        self.read_millivolts(&format!("in{file_number}_lcrit"), page)
    }

    fn read_millivolts(&self, file_name: &str, page: u8) -> Result<f64, Error> {
        let contents = self
            .pmbus
            .read_string(file_name, FileKind::Hwmon)
            .map_err(|e| {
                Error::failed(format!(
                    "Unable to read {file_name} for PAGE {page} of device {}: {e}",
                    self.name
                ))
            })?;
        let millivolts: u64 = contents.parse().map_err(|_| {
            Error::failed(format!(
                "Invalid millivolts value in {file_name} of device {}: {contents}",
                self.name
            ))
        })?;
        Ok(millivolts as f64 / 1000.0)
    }

    /// The 48-bit manufacturer status register, in host byte order.
    pub fn mfr_status(&self) -> Result<u64, Error> {
        self.pmbus
            .read("mfr_status", FileKind::HwmonDeviceDebug)
            .map_err(|e| {
                Error::failed(format!(
                    "Unable to read MFR_STATUS for device {}: {e}",
                    self.name
                ))
            })
    }

    pub fn page_to_file_number(&self) -> &BTreeMap<u8, u32> {
        &self.page_to_file_number
    }

    fn file_number(&self, page: u8) -> Result<u32, Error> {
        self.page_to_file_number.get(&page).copied().ok_or_else(|| {
            Error::failed(format!(
                "Unable to find hwmon file number for PAGE {page} of device {}",
                self.name
            ))
        })
    }

    /// Rebuilds the PMBus page to hwmon file number map.
    ///
    /// A file matching `in<N>_label` whose contents match `vout<V>` maps
    /// page `V - 1` to file number `N`. The map is cleared first; power
    /// devices may have been added or removed since the last build.
    pub fn build_page_to_file_number_map(&mut self) -> Result<(), Error> {
        self.page_to_file_number.clear();

        let file_names = self.pmbus.hwmon_file_names().map_err(|e| {
            Error::failed(format!(
                "Unable to map PMBus PAGE numbers to hwmon file numbers for device {}: {e}",
                self.name
            ))
        })?;

        for file_name in file_names {
            let Some(found) = label_file_regex().captures(&file_name) else {
                continue;
            };
            let Ok(file_number) = found[1].parse::<u32>() else {
                continue;
            };
            // An unreadable or unexpected label file is skipped; if the
            // mapping turns out to be needed, the later lookup fails.
            let Ok(contents) = self.pmbus.read_string(&file_name, FileKind::Hwmon) else {
                continue;
            };
            let Some(found) = label_contents_regex().captures(&contents) else {
                continue;
            };
            let Ok(vout_index) = found[1].parse::<u32>() else {
                continue;
            };
            if vout_index >= 1 && vout_index <= u8::MAX as u32 + 1 {
                self.page_to_file_number
                    .insert((vout_index - 1) as u8, file_number);
            }
        }
        Ok(())
    }

    /// Stores MFR_STATUS, best effort.
    fn store_mfr_status(&self, services: &mut dyn Services, additional_data: &mut AdditionalData) {
        if let Ok(value) = self.mfr_status() {
            services.log_info(&format!("Device {} MFR_STATUS: {value:#014x}", self.name));
            additional_data.insert("MFR_STATUS".to_string(), format!("{value:#014x}"));
        }
    }
}

macro_rules! delegate_device_common {
    () => {
        fn name(&self) -> &str {
            self.core.name()
        }

        fn rails(&self) -> &[Rail] {
            self.core.rails()
        }

        fn is_open(&self) -> bool {
            self.core.is_open()
        }

        fn open(&mut self, services: &mut dyn Services) -> Result<(), Error> {
            self.core.open(services)
        }

        fn close(&mut self) {
            self.core.close()
        }

        fn power_on(&mut self, services: &mut dyn Services) -> Result<(), Error> {
            self.core.power_on(services)
        }

        fn power_off(&mut self, services: &mut dyn Services) -> Result<(), Error> {
            self.core.power_off(services)
        }

        fn power_good(&mut self, services: &mut dyn Services) -> Result<bool, Error> {
            self.core.power_good(services)
        }

        fn gpio_values(&self, services: &mut dyn Services) -> Result<Vec<u8>, Error> {
            self.core.gpio_values(services)
        }

        fn status_word(&self, page: u8) -> Result<u16, Error> {
            self.core.status_word(page)
        }

        fn status_vout(&self, page: u8) -> Result<u8, Error> {
            self.core.status_vout(page)
        }

        fn read_vout(&self, page: u8) -> Result<f64, Error> {
            self.core.read_vout(page)
        }

        fn vout_uv_fault_limit(&self, page: u8) -> Result<f64, Error> {
            self.core.vout_uv_fault_limit(page)
        }

        fn prepare_for_pgood_fault_detection(
            &mut self,
            _services: &mut dyn Services,
        ) -> Result<(), Error> {
            self.core.build_page_to_file_number_map()
        }

        fn find_pgood_fault(
            &mut self,
            services: &mut dyn Services,
            power_supply_error: &str,
            additional_data: &mut AdditionalData,
        ) -> Result<String, Error> {
            find_pgood_fault(self, services, power_supply_error, additional_data)
        }
    };
}

/// UCD90160 16-rail sequencer.
pub struct Ucd90160 {
    core: Ucd90x,
}

impl Ucd90160 {
    pub const DEVICE_NAME: &'static str = "UCD90160";

    /// GPIO names indexed by the Pin IDs from the UCD90160 PMBus interface
    /// documentation, which match the chip's line offsets.
    const GPIO_NAMES: [&'static str; 26] = [
        "FPWM1_GPIO5",
        "FPWM2_GPIO6",
        "FPWM3_GPIO7",
        "FPWM4_GPIO8",
        "FPWM5_GPIO9",
        "FPWM6_GPIO10",
        "FPWM7_GPIO11",
        "FPWM8_GPIO12",
        "GPI1_PWM1",
        "GPI2_PWM2",
        "GPI3_PWM3",
        "GPI4_PWM4",
        "GPIO14",
        "GPIO15",
        "TDO_GPIO20",
        "TCK_GPIO19",
        "TMS_GPIO22",
        "TDI_GPIO21",
        "GPIO1",
        "GPIO2",
        "GPIO3",
        "GPIO4",
        "GPIO13",
        "GPIO16",
        "GPIO17",
        "GPIO18",
    ];

    pub fn new(
        name: &str,
        bus: u8,
        address: u16,
        power_control_gpio_name: &str,
        power_good_gpio_name: &str,
        rails: Vec<Rail>,
        services: &mut dyn Services,
    ) -> Self {
        Self {
            core: Ucd90x::new(
                name,
                bus,
                address,
                power_control_gpio_name,
                power_good_gpio_name,
                rails,
                services,
            ),
        }
    }

    pub fn core(&self) -> &Ucd90x {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Ucd90x {
        &mut self.core
    }
}

impl PowerSequencerDevice for Ucd90160 {
    delegate_device_common!();

    fn store_pgood_fault_debug_data(
        &self,
        services: &mut dyn Services,
        gpio_values: &[u8],
        additional_data: &mut AdditionalData,
    ) {
        self.core.store_mfr_status(services, additional_data);
        additional_data.insert("DEVICE_NAME".to_string(), self.name().to_string());

        if gpio_values.len() != Self::GPIO_NAMES.len() {
            // Unexpected number of values; fall back to a plain integer list
            store_gpio_values_plain(self.name(), services, gpio_values, additional_data);
            return;
        }

        // Journal the values in groups of four to limit the entry count
        services.log_info(&format!("Device {} GPIO values:", self.name()));
        const GROUP_SIZE: usize = 4;
        for (i, (name, value)) in Self::GPIO_NAMES.iter().zip(gpio_values).enumerate() {
            additional_data.insert(name.to_string(), value.to_string());
            if i % GROUP_SIZE == 0 {
                let count = GROUP_SIZE.min(Self::GPIO_NAMES.len() - i);
                let names = format_list(&Self::GPIO_NAMES[i..i + count]);
                let values = format_list(&gpio_values[i..i + count]);
                services.log_info(&format!("{names}: {values}"));
            }
        }
    }
}

/// UCD90320 32-rail sequencer.
pub struct Ucd90320 {
    core: Ucd90x,
}

impl Ucd90320 {
    pub const DEVICE_NAME: &'static str = "UCD90320";

    /// GPIO span groups with offsets matching the Pin IDs from the UCD90320
    /// PMBus interface documentation.
    const GPIO_GROUPS: [(&'static str, &'static str, usize, usize); 5] = [
        ("MAR01_24_GPIO_VALUES", "MAR01-24", 0, 24),
        ("EN1_32_GPIO_VALUES", "EN1-32", 24, 32),
        ("LGP01_16_GPIO_VALUES", "LGP01-16", 56, 16),
        ("DMON1_8_GPIO_VALUES", "DMON1-8", 72, 8),
        ("GPIO1_4_GPIO_VALUES", "GPIO1-4", 80, 4),
    ];

    pub fn new(
        name: &str,
        bus: u8,
        address: u16,
        power_control_gpio_name: &str,
        power_good_gpio_name: &str,
        rails: Vec<Rail>,
        services: &mut dyn Services,
    ) -> Self {
        Self {
            core: Ucd90x::new(
                name,
                bus,
                address,
                power_control_gpio_name,
                power_good_gpio_name,
                rails,
                services,
            ),
        }
    }

    pub fn core(&self) -> &Ucd90x {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut Ucd90x {
        &mut self.core
    }
}

impl PowerSequencerDevice for Ucd90320 {
    delegate_device_common!();

    fn store_pgood_fault_debug_data(
        &self,
        services: &mut dyn Services,
        gpio_values: &[u8],
        additional_data: &mut AdditionalData,
    ) {
        self.core.store_mfr_status(services, additional_data);
        additional_data.insert("DEVICE_NAME".to_string(), self.name().to_string());

        let (_, _, last_offset, last_count) = Self::GPIO_GROUPS[Self::GPIO_GROUPS.len() - 1];
        if gpio_values.len() != last_offset + last_count {
            store_gpio_values_plain(self.name(), services, gpio_values, additional_data);
            return;
        }

        services.log_info(&format!("Device {} GPIO values:", self.name()));
        for (data_name, journal_name, offset, count) in Self::GPIO_GROUPS {
            let values = format_list(&gpio_values[offset..offset + count]);
            additional_data.insert(data_name.to_string(), values.clone());
            services.log_info(&format!("{journal_name}: {values}"));
        }
    }
}
