//! Action execution environment.

use crate::error::{ActionError, ErrorCause};
use crate::rule::Rules;
use i2c::I2c;
use services::{AdditionalData, Services};
use std::collections::BTreeMap;

/// Maximum rule nesting depth. Bounds the recursion that `run_rule` can
/// produce through rules that call each other.
pub const MAX_RULE_DEPTH: u8 = 30;

/// Live I2C access to one configured device.
pub struct DeviceHandle {
    fru: String,
    i2c: Box<dyn I2c>,
}

impl DeviceHandle {
    pub fn new(fru: &str, i2c: Box<dyn I2c>) -> Self {
        Self {
            fru: fru.to_string(),
            i2c,
        }
    }

    /// Inventory path of the field-replaceable unit containing the device.
    pub fn fru(&self) -> &str {
        &self.fru
    }

    pub fn i2c(&mut self) -> &mut dyn I2c {
        &mut *self.i2c
    }

    /// Returns the I2C interface, opening it first if necessary.
    pub fn open_i2c(&mut self) -> Result<&mut dyn I2c, i2c::I2cError> {
        if !self.i2c.is_open() {
            self.i2c.open()?;
        }
        Ok(&mut *self.i2c)
    }
}

/// Registry of device handles keyed by device id.
///
/// Each handle is exclusively owned by one configured device; the registry
/// exists so actions can retarget through `set_device` without holding
/// references into the device tree.
#[derive(Default)]
pub struct DeviceHandles {
    handles: BTreeMap<String, DeviceHandle>,
}

impl DeviceHandles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device_id: &str, handle: DeviceHandle) {
        self.handles.insert(device_id.to_string(), handle);
    }

    pub fn get_mut(&mut self, device_id: &str) -> Option<&mut DeviceHandle> {
        self.handles.get_mut(device_id)
    }

    /// Closes the I2C interface of one device. Safe to call when already
    /// closed.
    pub fn close(&mut self, device_id: &str) {
        if let Some(handle) = self.handles.get_mut(device_id) {
            handle.i2c.close();
        }
    }

    pub fn is_open(&self, device_id: &str) -> bool {
        self.handles
            .get(device_id)
            .map(|handle| handle.i2c.is_open())
            .unwrap_or(false)
    }
}

/// Environment for a single rule or action-sequence execution.
///
/// Borrows the rule registry and device handles; lives only for the
/// duration of one execution.
pub struct ActionEnvironment<'a> {
    rules: &'a Rules,
    handles: &'a mut DeviceHandles,
    services: &'a mut dyn Services,
    device_id: String,
    volts: Option<f64>,
    rule_depth: u8,
    additional_error_data: AdditionalData,
}

impl<'a> ActionEnvironment<'a> {
    pub fn new(
        rules: &'a Rules,
        handles: &'a mut DeviceHandles,
        device_id: &str,
        services: &'a mut dyn Services,
    ) -> Self {
        Self {
            rules,
            handles,
            services,
            device_id: device_id.to_string(),
            volts: None,
            rule_depth: 0,
            additional_error_data: BTreeMap::new(),
        }
    }

    /// The rule registry. Returned with the environment's lifetime so a rule
    /// reference can be held across further environment use.
    pub fn rules(&self) -> &'a Rules {
        self.rules
    }

    pub fn services(&mut self) -> &mut dyn Services {
        self.services
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn set_device_id(&mut self, device_id: &str) {
        self.device_id = device_id.to_string();
    }

    /// Handle of the current device.
    pub fn device(&mut self) -> Result<&mut DeviceHandle, ErrorCause> {
        let device_id = self.device_id.clone();
        self.handles.get_mut(&device_id).ok_or_else(|| {
            ErrorCause::Internal(format!("Unable to find device with ID \"{device_id}\""))
        })
    }

    pub fn volts(&self) -> Option<f64> {
        self.volts
    }

    pub fn set_volts(&mut self, volts: f64) {
        self.volts = Some(volts);
    }

    pub fn rule_depth(&self) -> u8 {
        self.rule_depth
    }

    /// Increments the rule nesting depth, failing when the cap is exceeded.
    pub fn increment_rule_depth(&mut self, action: &str) -> Result<(), ActionError> {
        if self.rule_depth >= MAX_RULE_DEPTH {
            return Err(ActionError::with_detail(
                action,
                "Maximum rule depth exceeded by rule",
            ));
        }
        self.rule_depth += 1;
        Ok(())
    }

    pub fn decrement_rule_depth(&mut self) {
        if self.rule_depth > 0 {
            self.rule_depth -= 1;
        }
    }

    /// Adds one key/value pair to the diagnostic data captured during this
    /// execution.
    pub fn add_additional_error_data(&mut self, key: String, value: String) {
        self.additional_error_data.insert(key, value);
    }

    pub fn additional_error_data(&self) -> &AdditionalData {
        &self.additional_error_data
    }

    /// Consumes the environment, returning the captured diagnostic data.
    pub fn into_additional_error_data(self) -> AdditionalData {
        self.additional_error_data
    }
}
