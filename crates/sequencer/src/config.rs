//! Power sequencer configuration file parser.
//!
//! The file is JSON with two top-level properties: an optional
//! `chassis_templates` array and a `chassis` array. A chassis either defines
//! all of its properties inline or references a template by id together with
//! `template_variable_values`, whose entries expand `${name}` references in
//! the template's string values.

use crate::chassis::Chassis;
use crate::device::{PowerSequencerDevice, Ucd90160, Ucd90320};
use crate::rail::{Gpio, Rail};
use jsonutil::{
    no_variables, parse_boolean, parse_hex_byte, parse_string, parse_uint8, parse_unsigned,
    required_property, verify_is_array, verify_is_object, verify_property_count, ConfigFileError,
    ParseError, Variables,
};
use serde_json::Value;
use services::{MonitorOptions, Services};
use std::collections::BTreeMap;
use std::path::Path;

/// Standard configuration file directory on the BMC.
pub const STANDARD_CONFIG_FILE_DIR: &str = "/usr/share/vrd";

/// Parses a power sequencer configuration file into chassis objects.
pub fn parse(
    path: &Path,
    monitor_options: MonitorOptions,
    services: &mut dyn Services,
) -> Result<Vec<Chassis>, ConfigFileError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigFileError::new(path, e.to_string()))?;
    let root: Value = serde_json::from_str(&contents)
        .map_err(|e| ConfigFileError::new(path, e.to_string()))?;
    parse_root(&root, monitor_options, services)
        .map_err(|e| ConfigFileError::new(path, e.0))
}

fn parse_root(
    element: &Value,
    monitor_options: MonitorOptions,
    services: &mut dyn Services,
) -> Result<Vec<Chassis>, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let mut templates = BTreeMap::new();
    if let Some(templates_element) = element.get("chassis_templates") {
        templates = parse_chassis_template_array(templates_element)?;
        property_count += 1;
    }

    let chassis_element = required_property(element, "chassis")?;
    let chassis = parse_chassis_array(chassis_element, &templates, monitor_options, services)?;
    property_count += 1;

    verify_property_count(element, property_count)?;

    // A rail name may appear under at most one device
    let mut rail_names = std::collections::BTreeSet::new();
    for chassis in &chassis {
        for device in chassis.devices() {
            for rail in device.rails() {
                if !rail_names.insert(rail.name().to_string()) {
                    return Err(ParseError(format!("Duplicate rail name: {}", rail.name())));
                }
            }
        }
    }

    Ok(chassis)
}

fn parse_chassis_template_array<'a>(
    element: &'a Value,
) -> Result<BTreeMap<String, &'a Value>, ParseError> {
    verify_is_array(element)?;
    let mut templates = BTreeMap::new();
    for template_element in element.as_array().unwrap() {
        let (id, template) = parse_chassis_template(template_element)?;
        templates.insert(id, template);
    }
    Ok(templates)
}

/// Validates a chassis template's shape and returns its id.
///
/// The remaining properties cannot be parsed here; they may contain
/// variables whose values arrive with each referencing chassis.
fn parse_chassis_template(element: &Value) -> Result<(String, &Value), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let id_element = required_property(element, "id")?;
    let id = parse_string(id_element, false, no_variables())?;
    property_count += 1;

    required_property(element, "number")?;
    property_count += 1;
    required_property(element, "inventory_path")?;
    property_count += 1;
    required_property(element, "power_sequencers")?;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok((id, element))
}

fn parse_chassis_array(
    element: &Value,
    templates: &BTreeMap<String, &Value>,
    monitor_options: MonitorOptions,
    services: &mut dyn Services,
) -> Result<Vec<Chassis>, ParseError> {
    verify_is_array(element)?;
    let mut chassis = Vec::new();
    for chassis_element in element.as_array().unwrap() {
        chassis.push(parse_chassis(
            chassis_element,
            templates,
            monitor_options,
            services,
        )?);
    }
    Ok(chassis)
}

fn parse_chassis(
    element: &Value,
    templates: &BTreeMap<String, &Value>,
    monitor_options: MonitorOptions,
    services: &mut dyn Services,
) -> Result<Chassis, ParseError> {
    verify_is_object(element)?;

    // A chassis without a template reference defines everything inline
    if element.get("template_id").is_none() {
        return parse_chassis_properties(element, false, no_variables(), monitor_options, services);
    }

    let mut property_count = 0;
    if element.get("comments").is_some() {
        property_count += 1;
    }

    let template_id_element = required_property(element, "template_id")?;
    let template_id = parse_string(template_id_element, false, no_variables())?;
    property_count += 1;

    let variables_element = required_property(element, "template_variable_values")?;
    let variables = parse_variables(variables_element)?;
    property_count += 1;

    verify_property_count(element, property_count)?;

    let template = templates
        .get(&template_id)
        .ok_or_else(|| ParseError(format!("Invalid chassis template id: {template_id}")))?;
    parse_chassis_properties(template, true, &variables, monitor_options, services)
}

fn parse_chassis_properties(
    element: &Value,
    is_template: bool,
    variables: &Variables,
    monitor_options: MonitorOptions,
    services: &mut dyn Services,
) -> Result<Chassis, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    // The template id was already parsed by parse_chassis_template
    if is_template {
        required_property(element, "id")?;
        property_count += 1;
    }

    let number_element = required_property(element, "number")?;
    let number = parse_unsigned(number_element, variables)?;
    if number < 1 {
        return Err(ParseError("Invalid chassis number: Must be > 0".to_string()));
    }
    property_count += 1;

    let inventory_path_element = required_property(element, "inventory_path")?;
    let inventory_path = parse_string(inventory_path_element, false, variables)?;
    property_count += 1;

    let sequencers_element = required_property(element, "power_sequencers")?;
    let sequencers = parse_power_sequencer_array(sequencers_element, variables, services)?;
    property_count += 1;

    verify_property_count(element, property_count)?;

    Ok(Chassis::new(
        number as usize,
        &inventory_path,
        sequencers,
        monitor_options,
    ))
}

fn parse_variables(element: &Value) -> Result<Variables, ParseError> {
    verify_is_object(element)?;
    let mut variables = Variables::new();
    for (name, value_element) in element.as_object().unwrap() {
        let value = parse_string(value_element, false, no_variables())?;
        variables.insert(name.clone(), value);
    }
    Ok(variables)
}

fn parse_power_sequencer_array(
    element: &Value,
    variables: &Variables,
    services: &mut dyn Services,
) -> Result<Vec<Box<dyn PowerSequencerDevice>>, ParseError> {
    verify_is_array(element)?;
    let mut sequencers: Vec<Box<dyn PowerSequencerDevice>> = Vec::new();
    for sequencer_element in element.as_array().unwrap() {
        sequencers.push(parse_power_sequencer(sequencer_element, variables, services)?);
    }
    Ok(sequencers)
}

fn parse_power_sequencer(
    element: &Value,
    variables: &Variables,
    services: &mut dyn Services,
) -> Result<Box<dyn PowerSequencerDevice>, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let type_element = required_property(element, "type")?;
    let type_name = parse_string(type_element, false, variables)?;
    property_count += 1;

    let i2c_element = required_property(element, "i2c_interface")?;
    let (bus, address) = parse_i2c_interface(i2c_element, variables)?;
    property_count += 1;

    let control_element = required_property(element, "power_control_gpio_name")?;
    let power_control_gpio_name = parse_string(control_element, false, variables)?;
    property_count += 1;

    let pgood_element = required_property(element, "power_good_gpio_name")?;
    let power_good_gpio_name = parse_string(pgood_element, false, variables)?;
    property_count += 1;

    let rails_element = required_property(element, "rails")?;
    let rails = parse_rail_array(rails_element, variables)?;
    property_count += 1;

    verify_property_count(element, property_count)?;

    match type_name.as_str() {
        Ucd90160::DEVICE_NAME => Ok(Box::new(Ucd90160::new(
            &type_name,
            bus,
            address,
            &power_control_gpio_name,
            &power_good_gpio_name,
            rails,
            services,
        ))),
        Ucd90320::DEVICE_NAME => Ok(Box::new(Ucd90320::new(
            &type_name,
            bus,
            address,
            &power_control_gpio_name,
            &power_good_gpio_name,
            rails,
            services,
        ))),
        _ => Err(ParseError(format!(
            "Invalid power sequencer type: {type_name}"
        ))),
    }
}

fn parse_i2c_interface(element: &Value, variables: &Variables) -> Result<(u8, u16), ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let bus_element = required_property(element, "bus")?;
    let bus = parse_uint8(bus_element, variables)?;
    property_count += 1;

    let address_element = required_property(element, "address")?;
    let address = parse_hex_byte(address_element, variables)? as u16;
    property_count += 1;

    verify_property_count(element, property_count)?;
    Ok((bus, address))
}

fn parse_rail_array(element: &Value, variables: &Variables) -> Result<Vec<Rail>, ParseError> {
    verify_is_array(element)?;
    let mut rails = Vec::new();
    for rail_element in element.as_array().unwrap() {
        rails.push(parse_rail(rail_element, variables)?);
    }
    Ok(rails)
}

fn parse_rail(element: &Value, variables: &Variables) -> Result<Rail, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    if element.get("comments").is_some() {
        property_count += 1;
    }

    let name_element = required_property(element, "name")?;
    let name = parse_string(name_element, false, variables)?;
    property_count += 1;

    let mut presence = None;
    if let Some(presence_element) = element.get("presence") {
        presence = Some(parse_string(presence_element, false, variables)?);
        property_count += 1;
    }

    let mut page = None;
    if let Some(page_element) = element.get("page") {
        page = Some(parse_uint8(page_element, variables)?);
        property_count += 1;
    }

    let mut is_power_supply_rail = false;
    if let Some(psu_element) = element.get("is_power_supply_rail") {
        is_power_supply_rail = parse_boolean(psu_element, variables)?;
        property_count += 1;
    }

    let mut check_status_vout = false;
    if let Some(check_element) = element.get("check_status_vout") {
        check_status_vout = parse_boolean(check_element, variables)?;
        property_count += 1;
    }

    let mut compare_voltage_to_limit = false;
    if let Some(compare_element) = element.get("compare_voltage_to_limit") {
        compare_voltage_to_limit = parse_boolean(compare_element, variables)?;
        property_count += 1;
    }

    let mut gpio = None;
    if let Some(gpio_element) = element.get("gpio") {
        gpio = Some(parse_gpio(gpio_element, variables)?);
        property_count += 1;
    }

    // STATUS_VOUT and voltage comparison both read PMBus data for the
    // rail's page, so a page is required with either
    if (check_status_vout || compare_voltage_to_limit) && page.is_none() {
        return Err(ParseError("Required property missing: page".to_string()));
    }

    verify_property_count(element, property_count)?;

    Rail::new(
        &name,
        presence,
        page,
        is_power_supply_rail,
        check_status_vout,
        compare_voltage_to_limit,
        gpio,
    )
    .map_err(|e| ParseError(e.to_string()))
}

fn parse_gpio(element: &Value, variables: &Variables) -> Result<Gpio, ParseError> {
    verify_is_object(element)?;
    let mut property_count = 0;

    let line_element = required_property(element, "line")?;
    let line = parse_unsigned(line_element, variables)? as u32;
    property_count += 1;

    let mut active_low = false;
    if let Some(active_low_element) = element.get("active_low") {
        active_low = parse_boolean(active_low_element, variables)?;
        property_count += 1;
    }

    verify_property_count(element, property_count)?;
    Ok(Gpio { line, active_low })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sim::SimServices;

    fn parse_value(value: &serde_json::Value, services: &mut SimServices) -> Result<Vec<Chassis>, ParseError> {
        parse_root(value, MonitorOptions::all(), services)
    }

    fn sequencer_json(rails: serde_json::Value) -> serde_json::Value {
        json!({
            "type": "UCD90320",
            "i2c_interface": {"bus": 3, "address": "0x11"},
            "power_control_gpio_name": "chassis_control_power",
            "power_good_gpio_name": "chassis_pgood",
            "rails": rails
        })
    }

    #[test]
    fn test_parse_inline_chassis() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis": [{
                "comments": ["Primary chassis"],
                "number": 1,
                "inventory_path": "/xyz/openbmc_project/inventory/system/chassis",
                "power_sequencers": [sequencer_json(json!([
                    {"name": "VDD_A", "page": 0, "check_status_vout": true},
                    {"name": "VCS_B", "gpio": {"line": 7, "active_low": true}},
                    {"name": "PSU_RAIL", "is_power_supply_rail": true,
                     "presence": "/xyz/openbmc_project/inventory/system/chassis/psu0",
                     "page": 1, "compare_voltage_to_limit": true}
                ]))]
            }]
        });

        let chassis = parse_value(&config, &mut services).unwrap();
        assert_eq!(chassis.len(), 1);
        assert_eq!(chassis[0].number(), 1);
        assert_eq!(
            chassis[0].inventory_path(),
            "/xyz/openbmc_project/inventory/system/chassis"
        );
        let devices = chassis[0].devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name(), "UCD90320");
        let rails = devices[0].rails();
        assert_eq!(rails.len(), 3);
        assert_eq!(rails[0].name(), "VDD_A");
        assert!(rails[0].check_status_vout());
        assert_eq!(rails[1].gpio().unwrap().line, 7);
        assert!(rails[1].gpio().unwrap().active_low);
        assert!(rails[2].is_power_supply_rail());
        assert_eq!(rails[2].page(), Some(1));
    }

    #[test]
    fn test_parse_chassis_template() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis_templates": [{
                "id": "compute_chassis",
                "number": "${number}",
                "inventory_path": "/xyz/openbmc_project/inventory/system/chassis${number}",
                "power_sequencers": [{
                    "type": "UCD90160",
                    "i2c_interface": {"bus": "${bus}", "address": "0x70"},
                    "power_control_gpio_name": "control${number}",
                    "power_good_gpio_name": "pgood${number}",
                    "rails": [{"name": "VDD_${number}"}]
                }]
            }],
            "chassis": [
                {"template_id": "compute_chassis",
                 "template_variable_values": {"number": "2", "bus": "7"}},
                {"template_id": "compute_chassis",
                 "template_variable_values": {"number": "3", "bus": "8"}}
            ]
        });

        let chassis = parse_value(&config, &mut services).unwrap();
        assert_eq!(chassis.len(), 2);
        assert_eq!(chassis[0].number(), 2);
        assert_eq!(
            chassis[0].inventory_path(),
            "/xyz/openbmc_project/inventory/system/chassis2"
        );
        assert_eq!(chassis[0].devices()[0].rails()[0].name(), "VDD_2");
        assert_eq!(chassis[1].number(), 3);
        assert_eq!(chassis[1].devices()[0].rails()[0].name(), "VDD_3");
    }

    #[test]
    fn test_template_reference_allows_no_extra_properties() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis_templates": [{
                "id": "t", "number": 1, "inventory_path": "/inv",
                "power_sequencers": []
            }],
            "chassis": [{
                "template_id": "t",
                "template_variable_values": {},
                "number": 4
            }]
        });
        let err = parse_value(&config, &mut services).unwrap_err();
        assert_eq!(err.0, "Element contains an invalid property");
    }

    #[test]
    fn test_unknown_template_id() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis": [{
                "template_id": "missing",
                "template_variable_values": {}
            }]
        });
        let err = parse_value(&config, &mut services).unwrap_err();
        assert_eq!(err.0, "Invalid chassis template id: missing");
    }

    #[test]
    fn test_chassis_number_zero_rejected() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis": [{
                "number": 0,
                "inventory_path": "/inv",
                "power_sequencers": []
            }]
        });
        let err = parse_value(&config, &mut services).unwrap_err();
        assert_eq!(err.0, "Invalid chassis number: Must be > 0");
    }

    #[test]
    fn test_invalid_sequencer_type() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis": [{
                "number": 1,
                "inventory_path": "/inv",
                "power_sequencers": [{
                    "type": "ADM1266",
                    "i2c_interface": {"bus": 3, "address": "0x11"},
                    "power_control_gpio_name": "a",
                    "power_good_gpio_name": "b",
                    "rails": []
                }]
            }]
        });
        let err = parse_value(&config, &mut services).unwrap_err();
        assert_eq!(err.0, "Invalid power sequencer type: ADM1266");
    }

    #[test]
    fn test_rail_with_pmbus_check_requires_page() {
        let mut services = SimServices::new();
        let config = json!({
            "chassis": [{
                "number": 1,
                "inventory_path": "/inv",
                "power_sequencers": [sequencer_json(json!([
                    {"name": "VDD", "check_status_vout": true}
                ]))]
            }]
        });
        let err = parse_value(&config, &mut services).unwrap_err();
        assert_eq!(err.0, "Required property missing: page");
    }

    #[test]
    fn test_parse_file_wraps_errors_with_path(){
        let mut services = SimServices::new();
        let dir = std::env::temp_dir().join("sequencer_config_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = parse(&path, MonitorOptions::all(), &mut services).unwrap_err();
        assert_eq!(err.path, path);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
