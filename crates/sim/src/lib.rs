//! Hardware simulation for development and testing.
//!
//! Provides in-memory stand-ins for the I2C transport, the PMBus sysfs
//! adapter, and the system-services facade. State is shared through `Arc`
//! handles so a test can keep a handle to a device it has already given
//! away and inspect or mutate it mid-scenario.

use i2c::{BlockMode, I2c, I2cError};
use pmbus::{FileKind, Pmbus, PmbusError};
use sensors::{RailSensors, Sensors};
use services::{
    AdditionalData, ChassisStatusMonitor, MonitorOptions, Services, ServicesError,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use types::Severity;

/// Register file of one simulated I2C device.
#[derive(Debug, Default)]
pub struct SimI2cState {
    registers: BTreeMap<u8, Vec<u8>>,
    /// Bits that read back as 1 regardless of what was written, by register.
    stuck_bits: BTreeMap<u8, u8>,
    /// While set, every transaction fails with this description.
    fail: Option<String>,
    writes: Vec<(u8, Vec<u8>)>,
}

/// Simulated I2C device with a register map.
#[derive(Clone)]
pub struct SimI2c {
    bus: u8,
    address: u16,
    open: Arc<Mutex<bool>>,
    state: Arc<Mutex<SimI2cState>>,
}

impl SimI2c {
    pub fn new(bus: u8, address: u16) -> Self {
        Self {
            bus,
            address,
            open: Arc::new(Mutex::new(false)),
            state: Arc::new(Mutex::new(SimI2cState::default())),
        }
    }

    /// Sets the bytes a register returns.
    pub fn set_register(&self, register: u8, bytes: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .registers
            .insert(register, bytes.to_vec());
    }

    pub fn register(&self, register: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().registers.get(&register).cloned()
    }

    /// Marks bits of a register as stuck high: they read back as 1 no
    /// matter what was written. Useful for write-verification scenarios.
    pub fn set_stuck_bits(&self, register: u8, mask: u8) {
        self.state.lock().unwrap().stuck_bits.insert(register, mask);
    }

    /// Makes every following transaction fail.
    pub fn fail_with(&self, description: &str) {
        self.state.lock().unwrap().fail = Some(description.to_string());
    }

    pub fn clear_failure(&self) {
        self.state.lock().unwrap().fail = None;
    }

    /// All writes performed so far, in order.
    pub fn writes(&self) -> Vec<(u8, Vec<u8>)> {
        self.state.lock().unwrap().writes.clone()
    }

    fn check_failure(&self) -> Result<(), I2cError> {
        if let Some(description) = &self.state.lock().unwrap().fail {
            return Err(I2cError::Transaction {
                bus: self.bus,
                address: self.address,
                description: description.clone(),
            });
        }
        Ok(())
    }

    fn read(&self, register: u8, count: usize) -> Result<Vec<u8>, I2cError> {
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        let bytes = state
            .registers
            .get(&register)
            .ok_or_else(|| I2cError::Transaction {
                bus: self.bus,
                address: self.address,
                description: format!("no such register: 0x{register:02X}"),
            })?;
        if bytes.len() < count {
            return Err(I2cError::Transaction {
                bus: self.bus,
                address: self.address,
                description: format!(
                    "register 0x{register:02X} holds {} bytes, wanted {count}",
                    bytes.len()
                ),
            });
        }
        Ok(bytes[..count].to_vec())
    }

    fn write(&self, register: u8, bytes: &[u8]) -> Result<(), I2cError> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let mut stored = bytes.to_vec();
        if let Some(mask) = state.stuck_bits.get(&register) {
            if let Some(first) = stored.first_mut() {
                *first |= mask;
            }
        }
        state.registers.insert(register, stored);
        state.writes.push((register, bytes.to_vec()));
        Ok(())
    }
}

impl I2c for SimI2c {
    fn open(&mut self) -> Result<(), I2cError> {
        *self.open.lock().unwrap() = true;
        Ok(())
    }

    fn close(&mut self) {
        *self.open.lock().unwrap() = false;
    }

    fn is_open(&self) -> bool {
        *self.open.lock().unwrap()
    }

    fn bus(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u16 {
        self.address
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, I2cError> {
        Ok(self.read(register, 1)?[0])
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<(), I2cError> {
        self.write(register, &[value])
    }

    fn read_word(&mut self, register: u8) -> Result<u16, I2cError> {
        let bytes = self.read(register, 2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn write_word(&mut self, register: u8, value: u16) -> Result<(), I2cError> {
        self.write(register, &value.to_le_bytes())
    }

    fn read_block(
        &mut self,
        register: u8,
        count: u8,
        mode: BlockMode,
    ) -> Result<Vec<u8>, I2cError> {
        match mode {
            BlockMode::I2c => self.read(register, count as usize),
            BlockMode::SmBus => {
                self.check_failure()?;
                let state = self.state.lock().unwrap();
                Ok(state.registers.get(&register).cloned().unwrap_or_default())
            }
        }
    }

    fn write_block(
        &mut self,
        register: u8,
        data: &[u8],
        _mode: BlockMode,
    ) -> Result<(), I2cError> {
        self.write(register, data)
    }
}

/// Simulated PMBus sysfs adapter: a map of named files per kind.
#[derive(Clone, Default)]
pub struct SimPmbus {
    files: Arc<Mutex<BTreeMap<(FileKind, String), String>>>,
    fail: Arc<Mutex<Option<String>>>,
}

impl SimPmbus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_file(&self, kind: FileKind, name: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert((kind, name.to_string()), contents.to_string());
    }

    pub fn remove_file(&self, kind: FileKind, name: &str) {
        self.files.lock().unwrap().remove(&(kind, name.to_string()));
    }

    pub fn fail_with(&self, description: &str) {
        *self.fail.lock().unwrap() = Some(description.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail.lock().unwrap() = None;
    }

    fn get(&self, kind: FileKind, name: &str) -> Result<String, PmbusError> {
        if let Some(description) = self.fail.lock().unwrap().as_ref() {
            return Err(PmbusError::FileRead {
                name: name.to_string(),
                description: description.clone(),
            });
        }
        self.files
            .lock()
            .unwrap()
            .get(&(kind, name.to_string()))
            .cloned()
            .ok_or_else(|| PmbusError::FileRead {
                name: name.to_string(),
                description: "no such file".to_string(),
            })
    }
}

impl Pmbus for SimPmbus {
    fn read(&self, name: &str, kind: FileKind) -> Result<u64, PmbusError> {
        let contents = self.get(kind, name)?;
        let value = contents.trim();
        let parsed = if let Some(hex) = value.strip_prefix("0x") {
            u64::from_str_radix(hex, 16)
        } else {
            value.parse()
        };
        parsed.map_err(|_| PmbusError::BadValue {
            name: name.to_string(),
            value: value.to_string(),
        })
    }

    fn read_string(&self, name: &str, kind: FileKind) -> Result<String, PmbusError> {
        Ok(self.get(kind, name)?.trim().to_string())
    }

    fn hwmon_file_names(&self) -> Result<Vec<String>, PmbusError> {
        if let Some(description) = self.fail.lock().unwrap().as_ref() {
            return Err(PmbusError::FileRead {
                name: "hwmon".to_string(),
                description: description.clone(),
            });
        }
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|(kind, _)| *kind == FileKind::Hwmon)
            .map(|(_, name)| name.clone())
            .collect())
    }
}

/// Scripted status of one simulated chassis.
#[derive(Debug, Clone)]
pub struct SimChassisStatus {
    pub present: bool,
    pub available: bool,
    pub enabled: bool,
    pub input_power_good: bool,
    pub power_supplies_power_good: bool,
    /// While set, every status read fails with this description.
    pub fail: Option<String>,
}

impl Default for SimChassisStatus {
    fn default() -> Self {
        Self {
            present: true,
            available: true,
            enabled: true,
            input_power_good: true,
            power_supplies_power_good: true,
            fail: None,
        }
    }
}

/// One logged error event.
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub message: String,
    pub severity: Severity,
    pub additional_data: AdditionalData,
}

#[derive(Default)]
struct SimServicesState {
    info_messages: Vec<String>,
    error_messages: Vec<String>,
    logged_events: Vec<LoggedEvent>,
    presence: BTreeMap<String, bool>,
    presence_fail: Option<String>,
    gpio_chips: BTreeMap<String, Vec<u8>>,
    gpio_lines: BTreeMap<String, u8>,
    vpd: BTreeMap<(String, String), Vec<u8>>,
    pmbus: BTreeMap<(u8, u16), SimPmbus>,
    chassis_status: BTreeMap<usize, SimChassisStatus>,
}

/// Scripted implementation of the services facade.
pub struct SimServices {
    state: Arc<Mutex<SimServicesState>>,
    sensors: RailSensors,
}

impl Default for SimServices {
    fn default() -> Self {
        Self::new()
    }
}

impl SimServices {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimServicesState::default())),
            sensors: RailSensors::new(),
        }
    }

    pub fn set_present(&self, inventory_path: &str, present: bool) {
        self.state
            .lock()
            .unwrap()
            .presence
            .insert(inventory_path.to_string(), present);
    }

    pub fn fail_presence_with(&self, description: &str) {
        self.state.lock().unwrap().presence_fail = Some(description.to_string());
    }

    pub fn set_gpio_values(&self, chip_label: &str, values: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .gpio_chips
            .insert(chip_label.to_string(), values.to_vec());
    }

    pub fn set_gpio_line(&self, line_name: &str, value: u8) {
        self.state
            .lock()
            .unwrap()
            .gpio_lines
            .insert(line_name.to_string(), value);
    }

    pub fn gpio_line(&self, line_name: &str) -> Option<u8> {
        self.state.lock().unwrap().gpio_lines.get(line_name).copied()
    }

    pub fn set_vpd(&self, inventory_path: &str, keyword: &str, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .vpd
            .insert((inventory_path.to_string(), keyword.to_string()), value.to_vec());
    }

    /// Registers the PMBus adapter handed out for a bus/address pair.
    pub fn add_pmbus(&self, bus: u8, address: u16, pmbus: SimPmbus) {
        self.state.lock().unwrap().pmbus.insert((bus, address), pmbus);
    }

    pub fn set_chassis_status(&self, chassis_number: usize, status: SimChassisStatus) {
        self.state
            .lock()
            .unwrap()
            .chassis_status
            .insert(chassis_number, status);
    }

    pub fn info_messages(&self) -> Vec<String> {
        self.state.lock().unwrap().info_messages.clone()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.state.lock().unwrap().error_messages.clone()
    }

    pub fn logged_events(&self) -> Vec<LoggedEvent> {
        self.state.lock().unwrap().logged_events.clone()
    }

    pub fn clear_journal(&self) {
        let mut state = self.state.lock().unwrap();
        state.info_messages.clear();
        state.error_messages.clear();
    }

    pub fn rail_sensors(&self) -> &RailSensors {
        &self.sensors
    }
}

impl Services for SimServices {
    fn log_info(&mut self, message: &str) {
        debug!(target: "sim", "info: {message}");
        self.state
            .lock()
            .unwrap()
            .info_messages
            .push(message.to_string());
    }

    fn log_error(&mut self, message: &str) {
        debug!(target: "sim", "error: {message}");
        self.state
            .lock()
            .unwrap()
            .error_messages
            .push(message.to_string());
    }

    fn log_event(&mut self, message: &str, severity: Severity, additional_data: AdditionalData) {
        let mut additional_data = additional_data;
        additional_data.insert("_PID".to_string(), std::process::id().to_string());
        if severity == Severity::Critical {
            additional_data.insert("SEVERITY_DETAIL".to_string(), "SYSTEM_TERM".to_string());
        }
        self.state.lock().unwrap().logged_events.push(LoggedEvent {
            message: message.to_string(),
            severity,
            additional_data,
        });
    }

    fn is_present(&mut self, inventory_path: &str) -> Result<bool, ServicesError> {
        let state = self.state.lock().unwrap();
        if let Some(description) = &state.presence_fail {
            return Err(ServicesError::Presence {
                inventory_path: inventory_path.to_string(),
                description: description.clone(),
            });
        }
        Ok(state.presence.get(inventory_path).copied().unwrap_or(true))
    }

    fn gpio_values(&mut self, chip_label: &str) -> Result<Vec<u8>, ServicesError> {
        self.state
            .lock()
            .unwrap()
            .gpio_chips
            .get(chip_label)
            .cloned()
            .ok_or_else(|| ServicesError::GpioChip {
                chip_label: chip_label.to_string(),
                description: "no GPIO chip with that label".to_string(),
            })
    }

    fn read_gpio(&mut self, line_name: &str) -> Result<u8, ServicesError> {
        self.state
            .lock()
            .unwrap()
            .gpio_lines
            .get(line_name)
            .copied()
            .ok_or_else(|| ServicesError::GpioLine {
                line_name: line_name.to_string(),
                description: "no GPIO line with that name".to_string(),
            })
    }

    fn set_gpio(&mut self, line_name: &str, value: u8) -> Result<(), ServicesError> {
        self.state
            .lock()
            .unwrap()
            .gpio_lines
            .insert(line_name.to_string(), value);
        Ok(())
    }

    fn vpd_value(
        &mut self,
        inventory_path: &str,
        keyword: &str,
    ) -> Result<Vec<u8>, ServicesError> {
        self.state
            .lock()
            .unwrap()
            .vpd
            .get(&(inventory_path.to_string(), keyword.to_string()))
            .cloned()
            .ok_or_else(|| ServicesError::Vpd {
                inventory_path: inventory_path.to_string(),
                keyword: keyword.to_string(),
                description: "no such keyword".to_string(),
            })
    }

    fn create_pmbus(
        &mut self,
        bus: u8,
        address: u16,
        _driver_name: &str,
        _instance: usize,
    ) -> Box<dyn Pmbus> {
        let pmbus = self
            .state
            .lock()
            .unwrap()
            .pmbus
            .entry((bus, address))
            .or_default()
            .clone();
        Box::new(pmbus)
    }

    fn create_status_monitor(
        &mut self,
        chassis_number: usize,
        _inventory_path: &str,
        _options: MonitorOptions,
    ) -> Box<dyn ChassisStatusMonitor> {
        Box::new(SimStatusMonitor {
            chassis_number,
            state: Arc::clone(&self.state),
        })
    }

    fn sensors(&mut self) -> &mut dyn Sensors {
        &mut self.sensors
    }
}

/// Status monitor reading the scripted chassis status.
pub struct SimStatusMonitor {
    chassis_number: usize,
    state: Arc<Mutex<SimServicesState>>,
}

impl SimStatusMonitor {
    fn status(&self) -> Result<SimChassisStatus, ServicesError> {
        let status = self
            .state
            .lock()
            .unwrap()
            .chassis_status
            .get(&self.chassis_number)
            .cloned()
            .unwrap_or_default();
        if let Some(description) = &status.fail {
            return Err(ServicesError::DBus(description.clone()));
        }
        Ok(status)
    }
}

impl ChassisStatusMonitor for SimStatusMonitor {
    fn chassis_number(&self) -> usize {
        self.chassis_number
    }

    fn is_present(&self) -> Result<bool, ServicesError> {
        Ok(self.status()?.present)
    }

    fn is_available(&self) -> Result<bool, ServicesError> {
        Ok(self.status()?.available)
    }

    fn is_enabled(&self) -> Result<bool, ServicesError> {
        Ok(self.status()?.enabled)
    }

    fn is_input_power_good(&self) -> Result<bool, ServicesError> {
        Ok(self.status()?.input_power_good)
    }

    fn is_power_supplies_power_good(&self) -> Result<bool, ServicesError> {
        Ok(self.status()?.power_supplies_power_good)
    }
}
