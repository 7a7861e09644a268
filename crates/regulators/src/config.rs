//! Regulators configuration file parser.
//!
//! The file is JSON with an optional `rules` array and a `chassis` array.
//! Each action object carries exactly one of the primitive action
//! properties, plus an optional `comments` property.

use crate::action::Action;
use crate::chassis::Chassis;
use crate::device::{Configuration, Device, PresenceDetection};
use crate::environment::{DeviceHandle, DeviceHandles};
use crate::rail::{Rail, SensorMonitoring};
use crate::rule::{Rule, Rules};
use crate::system::System;
use i2c::I2c;
use jsonutil::{
    no_variables, parse_boolean, parse_bit_position, parse_bit_value, parse_double,
    parse_hex_byte, parse_hex_byte_array, parse_int8, parse_string, parse_uint8,
    parse_unsigned, required_property, verify_is_array, verify_is_object,
    verify_property_count, ConfigFileError, ParseError, Variables,
};
use pmbus::{SensorDataFormat, VoutDataFormat};
use serde_json::Value;
use services::Services;
use std::path::Path;
use types::SensorType;

/// Standard configuration file directory on the BMC.
pub const STANDARD_CONFIG_FILE_DIR: &str = "/etc/vrd";

/// Factory producing the I2C handle for a configured device.
pub type I2cFactory<'a> = &'a mut dyn FnMut(u8, u16) -> Box<dyn I2c>;

/// Parses a regulators configuration file into a [`System`].
pub fn parse(
    path: &Path,
    i2c_factory: I2cFactory<'_>,
    services: &mut dyn Services,
) -> Result<System, ConfigFileError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigFileError::new(path, e.to_string()))?;
    let root: Value = serde_json::from_str(&contents)
        .map_err(|e| ConfigFileError::new(path, e.to_string()))?;
    parse_root(&root, i2c_factory, services).map_err(|e| ConfigFileError::new(path, e.0))
}

/// Parses an already loaded JSON tree. Used directly by tests.
pub fn parse_root(
    element: &Value,
    i2c_factory: I2cFactory<'_>,
    _services: &mut dyn Services,
) -> Result<System, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let mut rules = Rules::new();
    if let Some(rules_element) = element.get("rules") {
        rules = parse_rule_array(rules_element)?;
        property_count += 1;
    }

    let chassis_element = required_property(element, "chassis")?;
    let mut handles = DeviceHandles::new();
    let chassis = parse_chassis_array(chassis_element, &rules, &mut handles, i2c_factory)?;
    property_count += 1;

    verify_property_count(element, property_count)?;

    // Rail ids are globally unique, like rule and device ids
    let mut rail_ids = std::collections::BTreeSet::new();
    for chassis in &chassis {
        for device in chassis.devices() {
            for rail in device.rails() {
                if !rail_ids.insert(rail.id().to_string()) {
                    return Err(ParseError(format!("Duplicate rail ID: {}", rail.id())));
                }
            }
        }
    }

    Ok(System::new(rules, chassis, handles))
}

fn parse_rule_array(element: &Value) -> Result<Rules, ParseError> {
    verify_is_array(element)?;
    let mut rules = Rules::new();
    for rule_element in element.as_array().unwrap() {
        let rule = parse_rule(rule_element)?;
        if rules.contains(rule.id()) {
            return Err(ParseError(format!("Duplicate rule ID: {}", rule.id())));
        }
        rules.insert(rule);
    }
    Ok(rules)
}

fn parse_rule(element: &Value) -> Result<Rule, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let id_element = required_property(element, "id")?;
    let id = parse_string(id_element, false, no_variables())?;
    property_count += 1;

    let actions_element = required_property(element, "actions")?;
    let actions = parse_action_array(actions_element, no_variables())?;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok(Rule::new(&id, actions))
}

fn parse_chassis_array(
    element: &Value,
    rules: &Rules,
    handles: &mut DeviceHandles,
    i2c_factory: I2cFactory<'_>,
) -> Result<Vec<Chassis>, ParseError> {
    verify_is_array(element)?;
    let mut chassis = Vec::new();
    for chassis_element in element.as_array().unwrap() {
        chassis.push(parse_chassis(chassis_element, rules, handles, i2c_factory)?);
    }
    Ok(chassis)
}

fn parse_chassis(
    element: &Value,
    rules: &Rules,
    handles: &mut DeviceHandles,
    i2c_factory: I2cFactory<'_>,
) -> Result<Chassis, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let number_element = required_property(element, "number")?;
    let number = parse_unsigned(number_element, no_variables())?;
    if number < 1 {
        return Err(ParseError("Invalid chassis number: Must be > 0".to_string()));
    }
    property_count += 1;

    let inventory_path_element = required_property(element, "inventory_path")?;
    let inventory_path = parse_string(inventory_path_element, false, no_variables())?;
    property_count += 1;

    let mut devices = Vec::new();
    if let Some(devices_element) = element.get("devices") {
        devices = parse_device_array(devices_element, rules, handles, i2c_factory)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Chassis::new(number as usize, &inventory_path, devices))
}

fn parse_device_array(
    element: &Value,
    rules: &Rules,
    handles: &mut DeviceHandles,
    i2c_factory: I2cFactory<'_>,
) -> Result<Vec<Device>, ParseError> {
    verify_is_array(element)?;
    let mut devices = Vec::new();
    for device_element in element.as_array().unwrap() {
        devices.push(parse_device(device_element, rules, handles, i2c_factory)?);
    }
    Ok(devices)
}

fn parse_device(
    element: &Value,
    rules: &Rules,
    handles: &mut DeviceHandles,
    i2c_factory: I2cFactory<'_>,
) -> Result<Device, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let id_element = required_property(element, "id")?;
    let id = parse_string(id_element, false, no_variables())?;
    property_count += 1;

    let is_regulator_element = required_property(element, "is_regulator")?;
    let is_regulator = parse_boolean(is_regulator_element, no_variables())?;
    property_count += 1;

    let fru_element = required_property(element, "fru")?;
    let fru = parse_string(fru_element, false, no_variables())?;
    property_count += 1;

    let i2c_element = required_property(element, "i2c_interface")?;
    let (bus, address) = parse_i2c_interface(i2c_element)?;
    property_count += 1;

    let mut presence_detection = None;
    if let Some(presence_element) = element.get("presence_detection") {
        presence_detection = Some(PresenceDetection::new(parse_rule_id_or_actions(
            presence_element,
        )?));
        property_count += 1;
    }

    let mut configuration = None;
    if let Some(configuration_element) = element.get("configuration") {
        configuration = Some(parse_configuration(configuration_element)?);
        property_count += 1;
    }

    let mut rails = Vec::new();
    if let Some(rails_element) = element.get("rails") {
        rails = parse_rail_array(rails_element)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;

    if handles.get_mut(&id).is_some() {
        return Err(ParseError(format!("Duplicate device ID: {id}")));
    }
    handles.insert(&id, DeviceHandle::new(&fru, i2c_factory(bus, address)));

    for action in rule_references(&presence_detection, &configuration, &rails) {
        if !rules.contains(action) {
            return Err(ParseError(format!("Unable to find rule with ID \"{action}\"")));
        }
    }

    Ok(Device::new(
        &id,
        is_regulator,
        &fru,
        presence_detection,
        configuration,
        rails,
    ))
}

/// Rule ids referenced by run_rule actions directly under the device's
/// behavior blocks, validated at parse time.
fn rule_references<'a>(
    presence_detection: &'a Option<PresenceDetection>,
    configuration: &'a Option<Configuration>,
    rails: &'a [Rail],
) -> Vec<&'a str> {
    fn top_level_rule_ids(actions: &[Action]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::RunRule { rule_id } => Some(rule_id.as_str()),
                _ => None,
            })
            .collect()
    }

    let mut ids = Vec::new();
    if let Some(detection) = presence_detection {
        ids.extend(top_level_rule_ids(detection.actions()));
    }
    if let Some(configuration) = configuration {
        ids.extend(top_level_rule_ids(configuration.actions()));
    }
    for rail in rails {
        if let Some(configuration) = rail.configuration() {
            ids.extend(top_level_rule_ids(configuration.actions()));
        }
        if let Some(monitoring) = rail.sensor_monitoring() {
            ids.extend(top_level_rule_ids(monitoring.actions()));
        }
    }
    ids
}

fn parse_i2c_interface(element: &Value) -> Result<(u8, u16), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let bus_element = required_property(element, "bus")?;
    let bus = parse_uint8(bus_element, no_variables())?;
    property_count += 1;

    let address_element = required_property(element, "address")?;
    let address = parse_hex_byte(address_element, no_variables())? as u16;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok((bus, address))
}

/// Parses a behavior block holding either a `rule_id` or an inline `actions`
/// array; exactly one must be present.
fn parse_rule_id_or_actions(element: &Value) -> Result<Vec<Action>, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;
    if element.get("comments").is_some() {
        property_count += 1;
    }

    let actions = parse_rule_id_or_actions_property(element, &mut property_count)?;
    verify_property_count(element, property_count)?;
    Ok(actions)
}

fn parse_rule_id_or_actions_property(
    element: &Value,
    property_count: &mut usize,
) -> Result<Vec<Action>, ParseError> {
    let rule_id = element.get("rule_id");
    let actions = element.get("actions");
    match (rule_id, actions) {
        (Some(rule_id_element), None) => {
            let rule_id = parse_string(rule_id_element, false, no_variables())?;
            *property_count += 1;
            Ok(vec![Action::RunRule { rule_id }])
        }
        (None, Some(actions_element)) => {
            let actions = parse_action_array(actions_element, no_variables())?;
            *property_count += 1;
            Ok(actions)
        }
        _ => Err(ParseError(
            "Invalid property combination: Must contain either rule_id or actions".to_string(),
        )),
    }
}

fn parse_configuration(element: &Value) -> Result<Configuration, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;
    if element.get("comments").is_some() {
        property_count += 1;
    }

    let mut volts = None;
    if let Some(volts_element) = element.get("volts") {
        volts = Some(parse_double(volts_element, no_variables())?);
        property_count += 1;
    }

    let actions = parse_rule_id_or_actions_property(element, &mut property_count)?;
    verify_property_count(element, property_count)?;
    Ok(Configuration::new(volts, actions))
}

fn parse_rail_array(element: &Value) -> Result<Vec<Rail>, ParseError> {
    verify_is_array(element)?;
    let mut rails = Vec::new();
    for rail_element in element.as_array().unwrap() {
        rails.push(parse_rail(rail_element)?);
    }
    Ok(rails)
}

fn parse_rail(element: &Value) -> Result<Rail, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let id_element = required_property(element, "id")?;
    let id = parse_string(id_element, false, no_variables())?;
    property_count += 1;

    let mut configuration = None;
    if let Some(configuration_element) = element.get("configuration") {
        configuration = Some(parse_configuration(configuration_element)?);
        property_count += 1;
    }

    let mut sensor_monitoring = None;
    if let Some(monitoring_element) = element.get("sensor_monitoring") {
        sensor_monitoring = Some(SensorMonitoring::new(parse_rule_id_or_actions(
            monitoring_element,
        )?));
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Rail::new(&id, configuration, sensor_monitoring))
}

pub(crate) fn parse_action_array(
    element: &Value,
    variables: &Variables,
) -> Result<Vec<Action>, ParseError> {
    verify_is_array(element)?;
    let mut actions = Vec::new();
    for action_element in element.as_array().unwrap() {
        actions.push(parse_action(action_element, variables)?);
    }
    Ok(actions)
}

pub(crate) fn parse_action(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let action = if let Some(e) = element.get("and") {
        property_count += 1;
        Action::And {
            actions: parse_action_array(e, variables)?,
        }
    } else if let Some(e) = element.get("compare_presence") {
        property_count += 1;
        parse_compare_presence(e, variables)?
    } else if let Some(e) = element.get("compare_vpd") {
        property_count += 1;
        parse_compare_vpd(e, variables)?
    } else if let Some(e) = element.get("i2c_capture_bytes") {
        property_count += 1;
        parse_i2c_capture_bytes(e, variables)?
    } else if let Some(e) = element.get("i2c_compare_bit") {
        property_count += 1;
        let (register, position, value) = parse_bit_fields(e, variables)?;
        Action::I2cCompareBit {
            register,
            position,
            value,
        }
    } else if let Some(e) = element.get("i2c_compare_byte") {
        property_count += 1;
        let (register, value, mask) = parse_byte_fields(e, variables)?;
        Action::I2cCompareByte {
            register,
            value,
            mask,
        }
    } else if let Some(e) = element.get("i2c_compare_bytes") {
        property_count += 1;
        let (register, values, masks) = parse_bytes_fields(e, variables, true)?;
        Action::I2cCompareBytes {
            register,
            values,
            masks,
        }
    } else if let Some(e) = element.get("i2c_write_bit") {
        property_count += 1;
        let (register, position, value) = parse_bit_fields(e, variables)?;
        Action::I2cWriteBit {
            register,
            position,
            value,
        }
    } else if let Some(e) = element.get("i2c_write_byte") {
        property_count += 1;
        let (register, value, mask) = parse_byte_fields(e, variables)?;
        Action::I2cWriteByte {
            register,
            value,
            mask,
        }
    } else if let Some(e) = element.get("i2c_write_bytes") {
        property_count += 1;
        let (register, values, masks) = parse_bytes_fields(e, variables, false)?;
        Action::I2cWriteBytes {
            register,
            values,
            masks,
        }
    } else if let Some(e) = element.get("if") {
        property_count += 1;
        parse_if(e, variables)?
    } else if let Some(e) = element.get("not") {
        property_count += 1;
        Action::Not {
            action: Box::new(parse_action(e, variables)?),
        }
    } else if let Some(e) = element.get("or") {
        property_count += 1;
        Action::Or {
            actions: parse_action_array(e, variables)?,
        }
    } else if let Some(e) = element.get("pmbus_read_sensor") {
        property_count += 1;
        parse_pmbus_read_sensor(e, variables)?
    } else if let Some(e) = element.get("pmbus_write_vout_command") {
        property_count += 1;
        parse_pmbus_write_vout_command(e, variables)?
    } else if let Some(e) = element.get("run_rule") {
        property_count += 1;
        Action::RunRule {
            rule_id: parse_string(e, false, variables)?,
        }
    } else if let Some(e) = element.get("set_device") {
        property_count += 1;
        Action::SetDevice {
            device_id: parse_string(e, false, variables)?,
        }
    } else {
        return Err(ParseError(
            "Required action type property missing".to_string(),
        ));
    };

    verify_property_count(element, property_count)?;
    Ok(action)
}

fn parse_compare_presence(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let fru_element = required_property(element, "fru")?;
    let fru = parse_string(fru_element, false, variables)?;
    property_count += 1;

    let value_element = required_property(element, "value")?;
    let value = parse_boolean(value_element, variables)?;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok(Action::ComparePresence { fru, value })
}

fn parse_compare_vpd(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let fru_element = required_property(element, "fru")?;
    let fru = parse_string(fru_element, false, variables)?;
    property_count += 1;

    let keyword_element = required_property(element, "keyword")?;
    let keyword = parse_string(keyword_element, false, variables)?;
    property_count += 1;

    // The expected value is either a string or explicit byte values
    let value = match (element.get("value"), element.get("byte_values")) {
        (Some(value_element), None) => {
            property_count += 1;
            parse_string(value_element, true, variables)?.into_bytes()
        }
        (None, Some(bytes_element)) => {
            property_count += 1;
            parse_hex_byte_array(bytes_element, variables)?
        }
        _ => {
            return Err(ParseError(
                "Invalid property combination: Must contain either value or byte_values"
                    .to_string(),
            ))
        }
    };

    verify_property_count(element, property_count)?;
    Ok(Action::CompareVpd {
        fru,
        keyword,
        value,
    })
}

fn parse_i2c_capture_bytes(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let register_element = required_property(element, "register")?;
    let register = parse_hex_byte(register_element, variables)?;
    property_count += 1;

    let count_element = required_property(element, "count")?;
    let count = parse_uint8(count_element, variables)?;
    if count < 1 {
        return Err(ParseError("Invalid byte count: Must be > 0".to_string()));
    }
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok(Action::I2cCaptureBytes { register, count })
}

/// Common fields of the bit-level actions.
fn parse_bit_fields(element: &Value, variables: &Variables) -> Result<(u8, u8, u8), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let register_element = required_property(element, "register")?;
    let register = parse_hex_byte(register_element, variables)?;
    property_count += 1;

    let position_element = required_property(element, "position")?;
    let position = parse_bit_position(position_element, variables)?;
    property_count += 1;

    let value_element = required_property(element, "value")?;
    let value = parse_bit_value(value_element, variables)?;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok((register, position, value))
}

/// Common fields of the single-byte actions; the mask defaults to 0xFF.
fn parse_byte_fields(element: &Value, variables: &Variables) -> Result<(u8, u8, u8), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let register_element = required_property(element, "register")?;
    let register = parse_hex_byte(register_element, variables)?;
    property_count += 1;

    let value_element = required_property(element, "value")?;
    let value = parse_hex_byte(value_element, variables)?;
    property_count += 1;

    let mut mask = 0xFF;
    if let Some(mask_element) = element.get("mask") {
        mask = parse_hex_byte(mask_element, variables)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok((register, value, mask))
}

/// Common fields of the multi-byte actions.
///
/// On compare, missing masks default to all bits; on write, missing masks
/// mean a straight write.
fn parse_bytes_fields(
    element: &Value,
    variables: &Variables,
    default_masks: bool,
) -> Result<(u8, Vec<u8>, Vec<u8>), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let register_element = required_property(element, "register")?;
    let register = parse_hex_byte(register_element, variables)?;
    property_count += 1;

    let values_element = required_property(element, "values")?;
    let values = parse_hex_byte_array(values_element, variables)?;
    if values.is_empty() {
        return Err(ParseError("Invalid byte values: Must not be empty".to_string()));
    }
    property_count += 1;

    let mut masks = Vec::new();
    if let Some(masks_element) = element.get("masks") {
        masks = parse_hex_byte_array(masks_element, variables)?;
        if masks.len() != values.len() {
            return Err(ParseError(
                "Invalid number of elements in masks".to_string(),
            ));
        }
        property_count += 1;
    } else if default_masks {
        masks = vec![0xFF; values.len()];
    }

    verify_property_count(element, property_count)?;
    Ok((register, values, masks))
}

fn parse_if(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let condition_element = required_property(element, "condition")?;
    let condition = Box::new(parse_action(condition_element, variables)?);
    property_count += 1;

    let then_element = required_property(element, "then")?;
    let then_actions = parse_action_array(then_element, variables)?;
    property_count += 1;

    let mut else_actions = Vec::new();
    if let Some(else_element) = element.get("else") {
        else_actions = parse_action_array(else_element, variables)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Action::If {
        condition,
        then_actions,
        else_actions,
    })
}

fn parse_pmbus_read_sensor(element: &Value, variables: &Variables) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let type_element = required_property(element, "type")?;
    let type_name = parse_string(type_element, false, variables)?;
    let sensor_type = SensorType::from_str(&type_name)
        .ok_or_else(|| ParseError(format!("Invalid sensor type: {type_name}")))?;
    property_count += 1;

    let command_element = required_property(element, "command")?;
    let command = parse_hex_byte(command_element, variables)?;
    property_count += 1;

    let format_element = required_property(element, "format")?;
    let format_name = parse_string(format_element, false, variables)?;
    let format = match format_name.as_str() {
        "linear_11" => SensorDataFormat::Linear11,
        "linear_16" => SensorDataFormat::Linear16,
        _ => return Err(ParseError(format!("Invalid format value: {format_name}"))),
    };
    property_count += 1;

    let mut exponent = None;
    if let Some(exponent_element) = element.get("exponent") {
        exponent = Some(parse_int8(exponent_element, variables)?);
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Action::PmbusReadSensor {
        sensor_type,
        command,
        format,
        exponent,
    })
}

fn parse_pmbus_write_vout_command(
    element: &Value,
    variables: &Variables,
) -> Result<Action, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let mut volts = None;
    if let Some(volts_element) = element.get("volts") {
        volts = Some(parse_double(volts_element, variables)?);
        property_count += 1;
    }

    let format_element = required_property(element, "format")?;
    let format_name = parse_string(format_element, false, variables)?;
    if format_name != "linear" {
        return Err(ParseError(format!("Invalid format value: {format_name}")));
    }
    property_count += 1;

    let mut exponent = None;
    if let Some(exponent_element) = element.get("exponent") {
        exponent = Some(parse_int8(exponent_element, variables)?);
        property_count += 1;
    }

    let mut is_verified = false;
    if let Some(is_verified_element) = element.get("is_verified") {
        is_verified = parse_boolean(is_verified_element, variables)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Action::PmbusWriteVoutCommand {
        volts,
        format: VoutDataFormat::Linear,
        exponent,
        is_verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sim::{SimI2c, SimServices};
    use std::collections::BTreeMap;

    fn parse_json(value: &Value) -> Result<System, ParseError> {
        let mut devices: BTreeMap<(u8, u16), SimI2c> = BTreeMap::new();
        let mut factory = move |bus: u8, address: u16| {
            Box::new(
                devices
                    .entry((bus, address))
                    .or_insert_with(|| SimI2c::new(bus, address))
                    .clone(),
            ) as Box<dyn I2c>
        };
        let mut services = SimServices::new();
        parse_root(value, &mut factory, &mut services)
    }

    #[test]
    fn test_parse_full_config() {
        let config = json!({
            "comments": ["Regulator configuration"],
            "rules": [
                {
                    "id": "set_voltage_rule",
                    "actions": [
                        {"pmbus_write_vout_command": {"format": "linear", "is_verified": true}}
                    ]
                },
                {
                    "id": "read_sensors_rule",
                    "actions": [
                        {"pmbus_read_sensor": {"type": "vout", "command": "0x8B", "format": "linear_16"}},
                        {"pmbus_read_sensor": {"type": "iout", "command": "0x8C", "format": "linear_11"}}
                    ]
                }
            ],
            "chassis": [{
                "number": 1,
                "inventory_path": "/xyz/openbmc_project/inventory/system/chassis",
                "devices": [{
                    "id": "vdd_regulator",
                    "is_regulator": true,
                    "fru": "/xyz/openbmc_project/inventory/system/chassis/motherboard/reg1",
                    "i2c_interface": {"bus": 3, "address": "0x70"},
                    "presence_detection": {
                        "actions": [{"compare_presence": {
                            "fru": "/xyz/openbmc_project/inventory/system/chassis/motherboard/cpu2",
                            "value": true
                        }}]
                    },
                    "configuration": {
                        "actions": [{"i2c_write_byte": {"register": "0x01", "value": "0x02"}}]
                    },
                    "rails": [{
                        "id": "VDD",
                        "configuration": {
                            "volts": 1.3,
                            "rule_id": "set_voltage_rule"
                        },
                        "sensor_monitoring": {
                            "rule_id": "read_sensors_rule"
                        }
                    }]
                }]
            }]
        });

        let system = parse_json(&config).unwrap();
        assert_eq!(system.rules().len(), 2);
        assert_eq!(system.chassis().len(), 1);
        let chassis = &system.chassis()[0];
        assert_eq!(chassis.number(), 1);
        let device = &chassis.devices()[0];
        assert_eq!(device.id(), "vdd_regulator");
        assert!(device.is_regulator());
        assert!(device.presence_detection().is_some());
        assert!(device.configuration().is_some());
        let rail = &device.rails()[0];
        assert_eq!(rail.id(), "VDD");
        assert_eq!(rail.configuration().unwrap().volts(), Some(1.3));
        assert!(rail.sensor_monitoring().is_some());
    }

    #[test]
    fn test_duplicate_rule_id_rejected() {
        let config = json!({
            "rules": [
                {"id": "r", "actions": [{"set_device": "a"}]},
                {"id": "r", "actions": [{"set_device": "b"}]}
            ],
            "chassis": []
        });
        let err = parse_json(&config).unwrap_err();
        assert_eq!(err.0, "Duplicate rule ID: r");
    }

    #[test]
    fn test_action_requires_exactly_one_type() {
        let err = parse_action(&json!({}), no_variables()).unwrap_err();
        assert_eq!(err.0, "Required action type property missing");

        let err = parse_action(
            &json!({
                "set_device": "a",
                "run_rule": "b"
            }),
            no_variables(),
        )
        .unwrap_err();
        assert_eq!(err.0, "Element contains an invalid property");
    }

    #[test]
    fn test_capture_bytes_count_must_be_positive() {
        let err = parse_action(
            &json!({"i2c_capture_bytes": {"register": "0xA0", "count": 0}}),
            no_variables(),
        )
        .unwrap_err();
        assert_eq!(err.0, "Invalid byte count: Must be > 0");
    }

    #[test]
    fn test_compare_bytes_masks_default_and_length_check() {
        let action = parse_action(
            &json!({"i2c_compare_bytes": {"register": "0x02", "values": ["0x56", "0x14"]}}),
            no_variables(),
        )
        .unwrap();
        match action {
            Action::I2cCompareBytes { values, masks, .. } => {
                assert_eq!(values, vec![0x56, 0x14]);
                assert_eq!(masks, vec![0xFF, 0xFF]);
            }
            _ => panic!("wrong action variant"),
        }

        let err = parse_action(
            &json!({"i2c_compare_bytes": {
                "register": "0x02",
                "values": ["0x56", "0x14"],
                "masks": ["0x7E"]
            }}),
            no_variables(),
        )
        .unwrap_err();
        assert_eq!(err.0, "Invalid number of elements in masks");
    }

    #[test]
    fn test_write_bytes_without_masks_writes_straight() {
        let action = parse_action(
            &json!({"i2c_write_bytes": {"register": "0x02", "values": ["0x56"]}}),
            no_variables(),
        )
        .unwrap();
        match action {
            Action::I2cWriteBytes { masks, .. } => assert!(masks.is_empty()),
            _ => panic!("wrong action variant"),
        }
    }

    #[test]
    fn test_if_action_parsing() {
        let action = parse_action(
            &json!({"if": {
                "condition": {"compare_presence": {"fru": "/inv/cpu3", "value": true}},
                "then": [{"run_rule": "configure_cpu3"}],
                "else": [{"set_device": "other"}]
            }}),
            no_variables(),
        )
        .unwrap();
        match action {
            Action::If {
                then_actions,
                else_actions,
                ..
            } => {
                assert_eq!(then_actions.len(), 1);
                assert_eq!(else_actions.len(), 1);
            }
            _ => panic!("wrong action variant"),
        }
    }

    #[test]
    fn test_behavior_block_requires_rule_id_or_actions() {
        let config = json!({
            "chassis": [{
                "number": 1,
                "inventory_path": "/inv",
                "devices": [{
                    "id": "dev",
                    "is_regulator": true,
                    "fru": "/inv/dev",
                    "i2c_interface": {"bus": 3, "address": "0x70"},
                    "presence_detection": {}
                }]
            }]
        });
        let err = parse_json(&config).unwrap_err();
        assert_eq!(
            err.0,
            "Invalid property combination: Must contain either rule_id or actions"
        );
    }

    #[test]
    fn test_referenced_rule_must_exist() {
        let config = json!({
            "chassis": [{
                "number": 1,
                "inventory_path": "/inv",
                "devices": [{
                    "id": "dev",
                    "is_regulator": true,
                    "fru": "/inv/dev",
                    "i2c_interface": {"bus": 3, "address": "0x70"},
                    "configuration": {"rule_id": "missing_rule"}
                }]
            }]
        });
        let err = parse_json(&config).unwrap_err();
        assert_eq!(err.0, "Unable to find rule with ID \"missing_rule\"");
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let config = json!({
            "chassis": [{
                "number": 1,
                "inventory_path": "/inv",
                "devices": [
                    {"id": "dev", "is_regulator": true, "fru": "/inv/dev",
                     "i2c_interface": {"bus": 3, "address": "0x70"}},
                    {"id": "dev", "is_regulator": false, "fru": "/inv/dev2",
                     "i2c_interface": {"bus": 3, "address": "0x71"}}
                ]
            }]
        });
        let err = parse_json(&config).unwrap_err();
        assert_eq!(err.0, "Duplicate device ID: dev");
    }

    #[test]
    fn test_invalid_sensor_type() {
        let err = parse_action(
            &json!({"pmbus_read_sensor": {"type": "vin", "command": "0x88", "format": "linear_11"}}),
            no_variables(),
        )
        .unwrap_err();
        assert_eq!(err.0, "Invalid sensor type: vin");
    }

    #[test]
    fn test_vout_command_format_must_be_linear() {
        let err = parse_action(
            &json!({"pmbus_write_vout_command": {"format": "vid"}}),
            no_variables(),
        )
        .unwrap_err();
        assert_eq!(err.0, "Invalid format value: vid");
    }
}
