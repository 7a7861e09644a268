//! Action primitives.
//!
//! Every action executes against an [`ActionEnvironment`] and returns a
//! boolean whose meaning is action-specific: comparisons return whether the
//! comparison held, mutators return true, and the composites combine their
//! children's values. Action names and parameters match the JSON
//! configuration file format.

use crate::environment::ActionEnvironment;
use crate::error::{ActionError, ErrorCause, WriteVerificationError};
use crate::rule::execute_actions;
use i2c::{BlockMode, I2c};
use pmbus::{
    convert_from_linear, convert_from_vout_linear, convert_to_vout_linear, parse_vout_mode,
    PmbusError, SensorDataFormat, VoutDataFormat, VOUT_COMMAND, VOUT_MODE,
};
use std::fmt;
use types::SensorType;

#[derive(Debug)]
pub enum Action {
    /// Compares hardware presence to an expected value.
    ComparePresence { fru: String, value: bool },

    /// Compares a VPD keyword value to an expected value.
    CompareVpd {
        fru: String,
        keyword: String,
        value: Vec<u8>,
    },

    /// Reads device register bytes into the captured diagnostic data.
    I2cCaptureBytes { register: u8, count: u8 },

    /// Compares one bit of a device register to a value.
    I2cCompareBit {
        register: u8,
        position: u8,
        value: u8,
    },

    /// Compares a device register, under a mask, to a value.
    I2cCompareByte { register: u8, value: u8, mask: u8 },

    /// Compares consecutive device register bytes, under masks, to values.
    I2cCompareBytes {
        register: u8,
        values: Vec<u8>,
        masks: Vec<u8>,
    },

    /// Writes one bit of a device register (read-modify-write).
    I2cWriteBit {
        register: u8,
        position: u8,
        value: u8,
    },

    /// Writes a device register, read-modify-write when masked.
    I2cWriteByte { register: u8, value: u8, mask: u8 },

    /// Writes consecutive device register bytes in one block transaction.
    I2cWriteBytes {
        register: u8,
        values: Vec<u8>,
        masks: Vec<u8>,
    },

    If {
        condition: Box<Action>,
        then_actions: Vec<Action>,
        else_actions: Vec<Action>,
    },

    And { actions: Vec<Action> },

    Or { actions: Vec<Action> },

    Not { action: Box<Action> },

    /// Reads a sensor value over PMBus and publishes it.
    PmbusReadSensor {
        sensor_type: SensorType,
        command: u8,
        format: SensorDataFormat,
        exponent: Option<i8>,
    },

    /// Writes the output voltage command in linear format.
    PmbusWriteVoutCommand {
        volts: Option<f64>,
        format: VoutDataFormat,
        exponent: Option<i8>,
        is_verified: bool,
    },

    RunRule { rule_id: String },

    SetDevice { device_id: String },
}

impl Action {
    /// Executes this action within the given environment.
    pub fn execute(&self, env: &mut ActionEnvironment<'_>) -> Result<bool, ActionError> {
        match self {
            Self::ComparePresence { fru, value } => {
                let present = env
                    .services()
                    .is_present(fru)
                    .map_err(|e| ActionError::with_cause(self, e))?;
                Ok(present == *value)
            }

            Self::CompareVpd {
                fru,
                keyword,
                value,
            } => {
                let actual = env
                    .services()
                    .vpd_value(fru, keyword)
                    .map_err(|e| ActionError::with_cause(self, e))?;
                Ok(actual == *value)
            }

            Self::I2cCaptureBytes { register, count } => {
                let values = self
                    .with_i2c(env, |i2c| i2c.read_block(*register, *count, BlockMode::I2c))?;
                let key = capture_key(env, *register);
                let value = hex_list(&values);
                env.add_additional_error_data(key, value);
                Ok(true)
            }

            Self::I2cCompareBit {
                register,
                position,
                value,
            } => {
                let register_value = self.with_i2c(env, |i2c| i2c.read_byte(*register))?;
                let actual = (register_value >> position) & 0x01;
                Ok(actual == *value)
            }

            Self::I2cCompareByte {
                register,
                value,
                mask,
            } => {
                let actual = self.with_i2c(env, |i2c| i2c.read_byte(*register))?;
                Ok((actual & mask) == *value)
            }

            Self::I2cCompareBytes {
                register,
                values,
                masks,
            } => {
                let actual = self.with_i2c(env, |i2c| {
                    i2c.read_block(*register, values.len() as u8, BlockMode::I2c)
                })?;
                Ok(values
                    .iter()
                    .zip(masks)
                    .zip(&actual)
                    .all(|((value, mask), actual)| (actual & mask) == *value))
            }

            Self::I2cWriteBit {
                register,
                position,
                value,
            } => {
                self.with_i2c(env, |i2c| {
                    let current = i2c.read_byte(*register)?;
                    let written = if *value == 1 {
                        current | (1 << position)
                    } else {
                        current & !(1 << position)
                    };
                    i2c.write_byte(*register, written)
                })?;
                Ok(true)
            }

            Self::I2cWriteByte {
                register,
                value,
                mask,
            } => {
                self.with_i2c(env, |i2c| {
                    let written = if *mask == 0xFF {
                        *value
                    } else {
                        let current = i2c.read_byte(*register)?;
                        (value & mask) | (current & !mask)
                    };
                    i2c.write_byte(*register, written)
                })?;
                Ok(true)
            }

            Self::I2cWriteBytes {
                register,
                values,
                masks,
            } => {
                self.with_i2c(env, |i2c| {
                    let written = if masks.is_empty() {
                        values.clone()
                    } else {
                        let current =
                            i2c.read_block(*register, values.len() as u8, BlockMode::I2c)?;
                        values
                            .iter()
                            .zip(masks)
                            .zip(&current)
                            .map(|((value, mask), current)| (value & mask) | (current & !mask))
                            .collect()
                    };
                    i2c.write_block(*register, &written, BlockMode::I2c)
                })?;
                Ok(true)
            }

            Self::If {
                condition,
                then_actions,
                else_actions,
            } => {
                if condition.execute(env)? {
                    execute_actions(then_actions, env)
                } else if !else_actions.is_empty() {
                    execute_actions(else_actions, env)
                } else {
                    Ok(false)
                }
            }

            Self::And { actions } => {
                for action in actions {
                    if !action.execute(env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            Self::Or { actions } => {
                for action in actions {
                    if action.execute(env)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Self::Not { action } => Ok(!action.execute(env)?),

            Self::PmbusReadSensor {
                sensor_type,
                command,
                format,
                exponent,
            } => {
                let value = self.with_i2c(env, |i2c| i2c.read_word(*command))?;
                let sensor_value = match format {
                    SensorDataFormat::Linear11 => convert_from_linear(value),
                    SensorDataFormat::Linear16 => {
                        let exponent = self.exponent_value(env, *exponent)?;
                        convert_from_vout_linear(value, exponent)
                    }
                };
                env.services()
                    .sensors()
                    .set_value(*sensor_type, sensor_value);
                Ok(true)
            }

            Self::PmbusWriteVoutCommand {
                volts,
                format: _,
                exponent,
                is_verified,
            } => {
                let volts = self.volts_value(env, *volts)?;
                let exponent = self.exponent_value(env, *exponent)?;
                let linear_value = convert_to_vout_linear(volts, exponent);

                // Low-order byte moves first, per PMBus
                self.with_i2c(env, |i2c| i2c.write_word(VOUT_COMMAND, linear_value))?;

                if *is_verified {
                    self.verify_write(env, linear_value)?;
                }
                Ok(true)
            }

            Self::RunRule { rule_id } => {
                env.increment_rule_depth(&self.to_string())?;
                let rules = env.rules();
                let rule = rules
                    .get(rule_id)
                    .map_err(|e| ActionError::with_cause(self, e))?;
                let result = rule.execute(env);
                env.decrement_rule_depth();
                result
            }

            Self::SetDevice { device_id } => {
                env.set_device_id(device_id);
                Ok(true)
            }
        }
    }

    /// Runs an I2C operation against the current device, opening the
    /// interface if necessary and wrapping failures with this action's
    /// description.
    fn with_i2c<T>(
        &self,
        env: &mut ActionEnvironment<'_>,
        operation: impl FnOnce(&mut dyn I2c) -> Result<T, i2c::I2cError>,
    ) -> Result<T, ActionError> {
        let device = env
            .device()
            .map_err(|e| self.internal_error(e))?;
        let i2c = device
            .open_i2c()
            .map_err(|e| ActionError::with_cause(self, e))?;
        operation(i2c).map_err(|e| ActionError::with_cause(self, e))
    }

    fn internal_error(&self, cause: ErrorCause) -> ActionError {
        ActionError::with_cause(self, cause)
    }

    /// Resolves the volts value from the action or the environment.
    fn volts_value(
        &self,
        env: &ActionEnvironment<'_>,
        volts: Option<f64>,
    ) -> Result<f64, ActionError> {
        volts
            .or_else(|| env.volts())
            .ok_or_else(|| ActionError::with_detail(self, "No volts value defined"))
    }

    /// Resolves the exponent from the action or from VOUT_MODE.
    fn exponent_value(
        &self,
        env: &mut ActionEnvironment<'_>,
        exponent: Option<i8>,
    ) -> Result<i8, ActionError> {
        if let Some(exponent) = exponent {
            return Ok(exponent);
        }

        let device_id = env.device_id().to_string();
        let fru = env
            .device()
            .map_err(|e| self.internal_error(e))?
            .fru()
            .to_string();
        let vout_mode = self.with_i2c(env, |i2c| i2c.read_byte(VOUT_MODE))?;

        let (format, parameter) = parse_vout_mode(vout_mode);
        if format != VoutDataFormat::Linear {
            return Err(ActionError::with_cause(
                self,
                PmbusError::UnsupportedFormat {
                    device_id,
                    inventory_path: fru,
                },
            ));
        }
        Ok(parameter)
    }

    /// Reads VOUT_COMMAND back and verifies all 16 bits match.
    fn verify_write(
        &self,
        env: &mut ActionEnvironment<'_>,
        value_written: u16,
    ) -> Result<(), ActionError> {
        let device_id = env.device_id().to_string();
        let fru = env
            .device()
            .map_err(|e| self.internal_error(e))?
            .fru()
            .to_string();
        let value_read = self.with_i2c(env, |i2c| i2c.read_word(VOUT_COMMAND))?;
        if value_read != value_written {
            let error = WriteVerificationError {
                message: format!(
                    "device: {device_id}, register: VOUT_COMMAND, \
                     value_written: {value_written:#X}, value_read: {value_read:#X}"
                ),
                device_id,
                inventory_path: fru,
            };
            return Err(ActionError::with_cause(self, error));
        }
        Ok(())
    }
}

/// Builds the capture key `<device_id>_register_0x<REG>`, adding a numeric
/// suffix until the key is unused.
fn capture_key(env: &ActionEnvironment<'_>, register: u8) -> String {
    let key = format!("{}_register_{register:#X}", env.device_id());
    if !env.additional_error_data().contains_key(&key) {
        return key;
    }
    let mut counter = 2;
    loop {
        let key_with_suffix = format!("{key}_{counter}");
        if !env.additional_error_data().contains_key(&key_with_suffix) {
            return key_with_suffix;
        }
        counter += 1;
    }
}

/// Formats bytes as `[ 0xXX, 0xXX, ... ]`.
fn hex_list(values: &[u8]) -> String {
    let mut out = String::from("[ ");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("{value:#X}"));
    }
    out.push_str(" ]");
    out
}

fn action_list(actions: &[Action]) -> String {
    let mut out = String::from("[ ");
    for (i, action) in actions.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("{{ {action} }}"));
    }
    out.push_str(" ]");
    out
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComparePresence { fru, value } => {
                write!(f, "compare_presence: {{ fru: {fru}, value: {value} }}")
            }
            Self::CompareVpd {
                fru,
                keyword,
                value,
            } => write!(
                f,
                "compare_vpd: {{ fru: {fru}, keyword: {keyword}, value: {} }}",
                hex_list(value)
            ),
            Self::I2cCaptureBytes { register, count } => write!(
                f,
                "i2c_capture_bytes: {{ register: {register:#X}, count: {count} }}"
            ),
            Self::I2cCompareBit {
                register,
                position,
                value,
            } => write!(
                f,
                "i2c_compare_bit: {{ register: {register:#X}, position: {position}, value: {value} }}"
            ),
            Self::I2cCompareByte {
                register,
                value,
                mask,
            } => write!(
                f,
                "i2c_compare_byte: {{ register: {register:#X}, value: {value:#X}, mask: {mask:#X} }}"
            ),
            Self::I2cCompareBytes {
                register,
                values,
                masks,
            } => write!(
                f,
                "i2c_compare_bytes: {{ register: {register:#X}, values: {}, masks: {} }}",
                hex_list(values),
                hex_list(masks)
            ),
            Self::I2cWriteBit {
                register,
                position,
                value,
            } => write!(
                f,
                "i2c_write_bit: {{ register: {register:#X}, position: {position}, value: {value} }}"
            ),
            Self::I2cWriteByte {
                register,
                value,
                mask,
            } => write!(
                f,
                "i2c_write_byte: {{ register: {register:#X}, value: {value:#X}, mask: {mask:#X} }}"
            ),
            Self::I2cWriteBytes {
                register,
                values,
                masks,
            } => write!(
                f,
                "i2c_write_bytes: {{ register: {register:#X}, values: {}, masks: {} }}",
                hex_list(values),
                hex_list(masks)
            ),
            Self::If {
                condition,
                then_actions,
                else_actions,
            } => {
                write!(
                    f,
                    "if: {{ condition: {{ {condition} }}, then: {}",
                    action_list(then_actions)
                )?;
                if !else_actions.is_empty() {
                    write!(f, ", else: {}", action_list(else_actions))?;
                }
                write!(f, " }}")
            }
            Self::And { actions } => write!(f, "and: {}", action_list(actions)),
            Self::Or { actions } => write!(f, "or: {}", action_list(actions)),
            Self::Not { action } => write!(f, "not: {{ {action} }}"),
            Self::PmbusReadSensor {
                sensor_type,
                command,
                format,
                exponent,
            } => {
                write!(
                    f,
                    "pmbus_read_sensor: {{ type: {sensor_type}, command: {command:#X}, format: {}",
                    format.as_str()
                )?;
                if let Some(exponent) = exponent {
                    write!(f, ", exponent: {exponent}")?;
                }
                write!(f, " }}")
            }
            Self::PmbusWriteVoutCommand {
                volts,
                format,
                exponent,
                is_verified,
            } => {
                write!(f, "pmbus_write_vout_command: {{ ")?;
                if let Some(volts) = volts {
                    write!(f, "volts: {volts}, ")?;
                }
                write!(f, "format: {}", format.as_str())?;
                if let Some(exponent) = exponent {
                    write!(f, ", exponent: {exponent}")?;
                }
                write!(f, ", is_verified: {is_verified} }}")
            }
            Self::RunRule { rule_id } => write!(f, "run_rule: {rule_id}"),
            Self::SetDevice { device_id } => write!(f, "set_device: {device_id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DeviceHandle;
    use crate::rule::Rule;
    use crate::rule::Rules;
    use services::Services;
    use sim::{SimI2c, SimServices};

    fn handles_with(device_id: &str, i2c: &SimI2c) -> crate::environment::DeviceHandles {
        let mut handles = crate::environment::DeviceHandles::new();
        handles.insert(
            device_id,
            DeviceHandle::new("/inv/system/chassis/motherboard/vdd_reg", Box::new(i2c.clone())),
        );
        handles
    }

    #[test]
    fn test_i2c_compare_byte_with_mask() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0xA0, &[0xD7]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        // 0xD7 & 0x7E == 0x56
        let action = Action::I2cCompareByte {
            register: 0xA0,
            value: 0x56,
            mask: 0x7E,
        };
        assert!(action.execute(&mut env).unwrap());

        let action = Action::I2cCompareByte {
            register: 0xA0,
            value: 0x57,
            mask: 0x7E,
        };
        assert!(!action.execute(&mut env).unwrap());
    }

    #[test]
    fn test_i2c_compare_bit() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x7C, &[0b0101_0000]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let bit_is = |position: u8, value: u8| Action::I2cCompareBit {
            register: 0x7C,
            position,
            value,
        };
        assert!(bit_is(6, 1).execute(&mut env).unwrap());
        assert!(bit_is(6, 0).execute(&mut env).map(|b| !b).unwrap());
        assert!(bit_is(0, 0).execute(&mut env).unwrap());
    }

    #[test]
    fn test_i2c_write_bit_read_modify_write() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x7C, &[0b0000_0000]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::I2cWriteBit {
            register: 0x7C,
            position: 5,
            value: 1,
        };
        assert!(action.execute(&mut env).unwrap());
        assert_eq!(i2c.register(0x7C).unwrap(), vec![0b0010_0000]);

        let action = Action::I2cWriteBit {
            register: 0x7C,
            position: 5,
            value: 0,
        };
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(0x7C).unwrap(), vec![0b0000_0000]);
    }

    #[test]
    fn test_i2c_write_byte_masked() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x01, &[0b1010_1010]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        // Full mask writes straight through without a read
        let action = Action::I2cWriteByte {
            register: 0x01,
            value: 0x55,
            mask: 0xFF,
        };
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(0x01).unwrap(), vec![0x55]);

        // Partial mask preserves unmasked bits
        let action = Action::I2cWriteByte {
            register: 0x01,
            value: 0xFF,
            mask: 0x0F,
        };
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(0x01).unwrap(), vec![0x5F]);
    }

    #[test]
    fn test_i2c_write_bytes_with_masks() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x02, &[0xFF, 0x00]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::I2cWriteBytes {
            register: 0x02,
            values: vec![0x00, 0xFF],
            masks: vec![0x0F, 0xF0],
        };
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(0x02).unwrap(), vec![0xF0, 0xF0]);
    }

    #[test]
    fn test_i2c_compare_bytes() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x02, &[0xD7, 0x14]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::I2cCompareBytes {
            register: 0x02,
            values: vec![0x56, 0x14],
            masks: vec![0x7E, 0xFF],
        };
        assert!(action.execute(&mut env).unwrap());

        let action = Action::I2cCompareBytes {
            register: 0x02,
            values: vec![0x56, 0x15],
            masks: vec![0x7E, 0xFF],
        };
        assert!(!action.execute(&mut env).unwrap());
    }

    #[test]
    fn test_i2c_capture_bytes_key_suffixes() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0xA0, &[0x56, 0x14, 0xDA]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::I2cCaptureBytes {
            register: 0xA0,
            count: 3,
        };
        action.execute(&mut env).unwrap();
        action.execute(&mut env).unwrap();
        action.execute(&mut env).unwrap();

        let data = env.additional_error_data();
        assert_eq!(
            data.get("vdd_reg_register_0xA0").unwrap(),
            "[ 0x56, 0x14, 0xDA ]"
        );
        assert!(data.contains_key("vdd_reg_register_0xA0_2"));
        assert!(data.contains_key("vdd_reg_register_0xA0_3"));
        assert_eq!(data.len(), 3);
    }

    #[test]
    fn test_composite_actions_short_circuit() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x01, &[0xFF]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let matches = Action::I2cCompareByte {
            register: 0x01,
            value: 0xFF,
            mask: 0xFF,
        };
        // Register 0x99 does not exist; executing this action would fail
        let explodes = Action::I2cCompareByte {
            register: 0x99,
            value: 0x00,
            mask: 0xFF,
        };

        // Or stops at the first true child
        let action = Action::Or {
            actions: vec![matches, explodes],
        };
        assert!(action.execute(&mut env).unwrap());

        // And stops at the first false child
        let differs = Action::I2cCompareByte {
            register: 0x01,
            value: 0x00,
            mask: 0xFF,
        };
        let explodes = Action::I2cCompareByte {
            register: 0x99,
            value: 0x00,
            mask: 0xFF,
        };
        let action = Action::And {
            actions: vec![differs, explodes],
        };
        assert!(!action.execute(&mut env).unwrap());
    }

    #[test]
    fn test_if_executes_matching_branch() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x01, &[0x01]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let condition = Box::new(Action::I2cCompareByte {
            register: 0x01,
            value: 0x01,
            mask: 0xFF,
        });
        let action = Action::If {
            condition,
            then_actions: vec![Action::I2cWriteByte {
                register: 0x02,
                value: 0xAA,
                mask: 0xFF,
            }],
            else_actions: vec![],
        };
        assert!(action.execute(&mut env).unwrap());
        assert_eq!(i2c.register(0x02).unwrap(), vec![0xAA]);

        // Condition false with no else returns false
        let condition = Box::new(Action::I2cCompareByte {
            register: 0x01,
            value: 0x02,
            mask: 0xFF,
        });
        let action = Action::If {
            condition,
            then_actions: vec![Action::I2cWriteByte {
                register: 0x03,
                value: 0xBB,
                mask: 0xFF,
            }],
            else_actions: vec![],
        };
        assert!(!action.execute(&mut env).unwrap());
        assert!(i2c.register(0x03).is_none());
    }

    #[test]
    fn test_not() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(0x01, &[0x01]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::Not {
            action: Box::new(Action::I2cCompareByte {
                register: 0x01,
                value: 0x01,
                mask: 0xFF,
            }),
        };
        assert!(!action.execute(&mut env).unwrap());
    }

    #[test]
    fn test_compare_presence_and_vpd() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        services.set_present("/inv/cpu0", true);
        services.set_vpd("/inv/vdd_reg", "CCIN", b"2D35");
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::ComparePresence {
            fru: "/inv/cpu0".to_string(),
            value: true,
        };
        assert!(action.execute(&mut env).unwrap());
        let action = Action::ComparePresence {
            fru: "/inv/cpu0".to_string(),
            value: false,
        };
        assert!(!action.execute(&mut env).unwrap());

        let action = Action::CompareVpd {
            fru: "/inv/vdd_reg".to_string(),
            keyword: "CCIN".to_string(),
            value: b"2D35".to_vec(),
        };
        assert!(action.execute(&mut env).unwrap());
        let action = Action::CompareVpd {
            fru: "/inv/vdd_reg".to_string(),
            keyword: "CCIN".to_string(),
            value: b"2D36".to_vec(),
        };
        assert!(!action.execute(&mut env).unwrap());
    }

    #[test]
    fn test_pmbus_write_vout_command_with_vout_mode_exponent() {
        let i2c = SimI2c::new(3, 0x70);
        // VOUT_MODE: linear format, exponent -9
        i2c.set_register(VOUT_MODE, &[0b0001_0111]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::PmbusWriteVoutCommand {
            volts: Some(3.3),
            format: VoutDataFormat::Linear,
            exponent: None,
            is_verified: true,
        };
        // 3.3 / 2^-9 = 1689.6, rounded to 1690 = 0x069A
        assert!(action.execute(&mut env).unwrap());
        assert_eq!(i2c.register(VOUT_COMMAND).unwrap(), vec![0x9A, 0x06]);
    }

    #[test]
    fn test_pmbus_write_vout_command_verification_failure() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(VOUT_MODE, &[0b0001_0111]);
        // Low bit of VOUT_COMMAND is stuck high: read-back differs
        i2c.set_stuck_bits(VOUT_COMMAND, 0x01);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::PmbusWriteVoutCommand {
            volts: Some(3.3),
            format: VoutDataFormat::Linear,
            exponent: None,
            is_verified: true,
        };
        let err = action.execute(&mut env).unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert!(source
            .to_string()
            .contains("value_written: 0x69A, value_read: 0x69B"));
    }

    #[test]
    fn test_pmbus_write_vout_command_volts_from_environment() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);
        env.set_volts(1.3);

        let action = Action::PmbusWriteVoutCommand {
            volts: None,
            format: VoutDataFormat::Linear,
            exponent: Some(-8),
            is_verified: false,
        };
        // 1.3 * 256 = 332.8, rounded to 333 = 0x014D
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(VOUT_COMMAND).unwrap(), vec![0x4D, 0x01]);
    }

    #[test]
    fn test_pmbus_write_vout_command_no_volts_defined() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::PmbusWriteVoutCommand {
            volts: None,
            format: VoutDataFormat::Linear,
            exponent: Some(-8),
            is_verified: false,
        };
        let err = action.execute(&mut env).unwrap_err();
        assert!(err.to_string().contains("No volts value defined"));
    }

    #[test]
    fn test_pmbus_write_vout_command_zero_volts() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::PmbusWriteVoutCommand {
            volts: Some(0.0),
            format: VoutDataFormat::Linear,
            exponent: Some(-9),
            is_verified: false,
        };
        action.execute(&mut env).unwrap();
        assert_eq!(i2c.register(VOUT_COMMAND).unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_pmbus_write_vout_command_unsupported_format() {
        let i2c = SimI2c::new(3, 0x70);
        // VOUT_MODE: VID format
        i2c.set_register(VOUT_MODE, &[0b0010_0000]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::PmbusWriteVoutCommand {
            volts: Some(1.0),
            format: VoutDataFormat::Linear,
            exponent: None,
            is_verified: false,
        };
        let err = action.execute(&mut env).unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("unsupported data format"));
        assert!(source.to_string().contains("vdd_reg"));
    }

    #[test]
    fn test_pmbus_read_sensor_linear_11() {
        let i2c = SimI2c::new(3, 0x70);
        // Exponent -4, mantissa 16: 1.0
        i2c.set_register(0x8C, &[0x10, 0xE0]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        services.sensors().start_cycle();
        services
            .sensors()
            .start_rail("VDD_A", "/inv/vdd_reg", "/inv/chassis");

        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);
        let action = Action::PmbusReadSensor {
            sensor_type: SensorType::Iout,
            command: 0x8C,
            format: SensorDataFormat::Linear11,
            exponent: None,
        };
        action.execute(&mut env).unwrap();
        drop(env);

        let sensor = services.rail_sensors().get("VDD_A_iout").unwrap();
        assert_eq!(sensor.value(), 1.0);
    }

    #[test]
    fn test_pmbus_read_sensor_linear_16_with_vout_mode() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.set_register(VOUT_MODE, &[0b0001_0111]);
        i2c.set_register(0x8B, &[0x9A, 0x06]);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        services.sensors().start_cycle();
        services
            .sensors()
            .start_rail("VDD_A", "/inv/vdd_reg", "/inv/chassis");

        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);
        let action = Action::PmbusReadSensor {
            sensor_type: SensorType::Vout,
            command: 0x8B,
            format: SensorDataFormat::Linear16,
            exponent: None,
        };
        action.execute(&mut env).unwrap();
        drop(env);

        let sensor = services.rail_sensors().get("VDD_A_vout").unwrap();
        assert_eq!(sensor.value(), 1690.0 / 512.0);
    }

    #[test]
    fn test_set_device_and_run_rule() {
        let i2c_a = SimI2c::new(3, 0x70);
        let i2c_b = SimI2c::new(3, 0x71);
        let mut handles = crate::environment::DeviceHandles::new();
        handles.insert("reg_a", DeviceHandle::new("/inv/reg_a", Box::new(i2c_a.clone())));
        handles.insert("reg_b", DeviceHandle::new("/inv/reg_b", Box::new(i2c_b.clone())));

        let mut rules = Rules::new();
        rules.insert(Rule::new(
            "write_marker",
            vec![Action::I2cWriteByte {
                register: 0x10,
                value: 0x42,
                mask: 0xFF,
            }],
        ));

        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "reg_a", &mut services);

        // Retarget to reg_b, then run the rule against it
        Action::SetDevice {
            device_id: "reg_b".to_string(),
        }
        .execute(&mut env)
        .unwrap();
        Action::RunRule {
            rule_id: "write_marker".to_string(),
        }
        .execute(&mut env)
        .unwrap();

        assert!(i2c_a.register(0x10).is_none());
        assert_eq!(i2c_b.register(0x10).unwrap(), vec![0x42]);
    }

    #[test]
    fn test_run_rule_depth_is_bounded() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let mut rules = Rules::new();
        rules.insert(Rule::new(
            "recurse",
            vec![Action::RunRule {
                rule_id: "recurse".to_string(),
            }],
        ));
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::RunRule {
            rule_id: "recurse".to_string(),
        };
        let err = action.execute(&mut env).unwrap_err();
        assert!(err.to_string().contains("Maximum rule depth exceeded"));
    }

    #[test]
    fn test_unknown_device_and_rule() {
        let i2c = SimI2c::new(3, 0x70);
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "missing", &mut services);

        let action = Action::I2cCompareBit {
            register: 0x7C,
            position: 0,
            value: 1,
        };
        let err = action.execute(&mut env).unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Unable to find device with ID \"missing\"");

        env.set_device_id("vdd_reg");
        let action = Action::RunRule {
            rule_id: "missing_rule".to_string(),
        };
        let err = action.execute(&mut env).unwrap_err();
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(
            source.to_string(),
            "Unable to find rule with ID \"missing_rule\""
        );
    }

    #[test]
    fn test_transport_error_wrapped_with_action_description() {
        let i2c = SimI2c::new(3, 0x70);
        i2c.fail_with("bus stuck low");
        let mut handles = handles_with("vdd_reg", &i2c);
        let rules = Rules::new();
        let mut services = SimServices::new();
        let mut env = ActionEnvironment::new(&rules, &mut handles, "vdd_reg", &mut services);

        let action = Action::I2cWriteByte {
            register: 0x01,
            value: 0x00,
            mask: 0xFF,
        };
        let err = action.execute(&mut env).unwrap_err();
        assert!(err
            .to_string()
            .contains("i2c_write_byte: { register: 0x1, value: 0x0, mask: 0xFF }"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("bus stuck low"));
    }

    #[test]
    fn test_display_formats() {
        let action = Action::I2cCompareBit {
            register: 0xA0,
            position: 3,
            value: 1,
        };
        assert_eq!(
            action.to_string(),
            "i2c_compare_bit: { register: 0xA0, position: 3, value: 1 }"
        );

        let action = Action::I2cWriteBytes {
            register: 0x02,
            values: vec![0x56, 0x14],
            masks: vec![0x7E, 0x3A]
        };
        assert_eq!(
            action.to_string(),
            "i2c_write_bytes: { register: 0x2, values: [ 0x56, 0x14 ], masks: [ 0x7E, 0x3A ] }"
        );

        let action = Action::PmbusWriteVoutCommand {
            volts: Some(1.3),
            format: VoutDataFormat::Linear,
            exponent: Some(-8),
            is_verified: true,
        };
        assert_eq!(
            action.to_string(),
            "pmbus_write_vout_command: { volts: 1.3, format: linear, exponent: -8, is_verified: true }"
        );

        let action = Action::PmbusReadSensor {
            sensor_type: SensorType::IoutPeak,
            command: 0xD0,
            format: SensorDataFormat::Linear11,
            exponent: None,
        };
        assert_eq!(
            action.to_string(),
            "pmbus_read_sensor: { type: iout_peak, command: 0xD0, format: linear_11 }"
        );

        let action = Action::RunRule {
            rule_id: "set_voltage_rule".to_string(),
        };
        assert_eq!(action.to_string(), "run_rule: set_voltage_rule");
    }
}
