//! JSON parsing helpers for the hardware configuration files.
//!
//! String values in the configuration may contain `${name}` variable
//! references. A variables map is passed into every parse function; when it
//! is non-empty, each string value is expanded before use. Numeric parsers
//! accept either a native JSON number or, when variables are in play, a
//! string that expands to a numeric literal. Conversion is fully consuming:
//! leading/trailing whitespace or trailing garbage is an error.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Variable name → value map for `${name}` expansion.
pub type Variables = BTreeMap<String, String>;

/// Empty variables map for parse calls outside any template.
pub fn no_variables() -> &'static Variables {
    static EMPTY: OnceLock<Variables> = OnceLock::new();
    EMPTY.get_or_init(Variables::new)
}

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").unwrap())
}

/// Error produced while parsing a configuration file.
///
/// Carries the file path so the journal entry can identify which of the
/// configuration files was bad.
#[derive(Debug, Error)]
#[error("ConfigFileError: {path}: {message}")]
pub struct ConfigFileError {
    pub path: PathBuf,
    pub message: String,
}

impl ConfigFileError {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error produced by the element-level parse helpers.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Returns the named property of a JSON object, or an error if missing.
pub fn required_property<'a>(element: &'a Value, property: &str) -> Result<&'a Value> {
    element
        .get(property)
        .ok_or_else(|| ParseError::new(format!("Required property missing: {property}")))
}

/// Verifies the element is a JSON object.
pub fn verify_is_object(element: &Value) -> Result<()> {
    if !element.is_object() {
        return Err(ParseError::new("Element is not an object"));
    }
    Ok(())
}

/// Verifies the element is a JSON array.
pub fn verify_is_array(element: &Value) -> Result<()> {
    if !element.is_array() {
        return Err(ParseError::new("Element is not an array"));
    }
    Ok(())
}

/// Verifies the object contains exactly the expected number of properties.
///
/// Parsers count each property they recognize; a mismatch means the element
/// contains an invalid property.
pub fn verify_property_count(element: &Value, expected: usize) -> Result<()> {
    let actual = element.as_object().map(|m| m.len()).unwrap_or(0);
    if actual != expected {
        return Err(ParseError::new("Element contains an invalid property"));
    }
    Ok(())
}

/// Expands `${name}` references in a string value.
///
/// Does nothing when the variables map is empty. An undefined variable is an
/// error.
pub fn expand_variables(value: &str, variables: &Variables) -> Result<String> {
    if variables.is_empty() {
        return Ok(value.to_string());
    }

    let re = variable_regex();
    let mut result = value.to_string();
    while let Some(found) = re.captures(&result) {
        let range = found.get(0).unwrap().range();
        let name = found[1].to_string();
        let replacement = variables
            .get(&name)
            .ok_or_else(|| ParseError::new(format!("Undefined variable: {name}")))?
            .clone();
        result.replace_range(range, &replacement);
    }
    Ok(result)
}

/// Parses a string value, expanding variables.
pub fn parse_string(element: &Value, is_empty_valid: bool, variables: &Variables) -> Result<String> {
    let value = element
        .as_str()
        .ok_or_else(|| ParseError::new("Element is not a string"))?;
    let value = expand_variables(value, variables)?;
    if value.is_empty() && !is_empty_valid {
        return Err(ParseError::new("Element contains an empty string"));
    }
    Ok(value)
}

/// Parses a boolean, accepting `"true"`/`"false"` strings when variables are
/// in play.
pub fn parse_boolean(element: &Value, variables: &Variables) -> Result<bool> {
    if let Some(value) = element.as_bool() {
        return Ok(value);
    }

    if element.is_string() && !variables.is_empty() {
        let value = parse_string(element, true, variables)?;
        match value.as_str() {
            "true" => return Ok(true),
            "false" => return Ok(false),
            _ => {}
        }
    }

    Err(ParseError::new("Element is not a boolean"))
}

/// Parses an integer, accepting a string containing a numeric literal when
/// variables are in play.
pub fn parse_integer(element: &Value, variables: &Variables) -> Result<i64> {
    if element.is_number() {
        return element
            .as_i64()
            .ok_or_else(|| ParseError::new("Element is not an integer"));
    }

    if element.is_string() && !variables.is_empty() {
        let value = parse_string(element, true, variables)?;
        if let Ok(parsed) = value.parse::<i64>() {
            return Ok(parsed);
        }
    }

    Err(ParseError::new("Element is not an integer"))
}

/// Parses a floating point number.
pub fn parse_double(element: &Value, variables: &Variables) -> Result<f64> {
    if let Some(value) = element.as_f64() {
        return Ok(value);
    }

    if element.is_string() && !variables.is_empty() {
        let value = parse_string(element, true, variables)?;
        if let Ok(parsed) = value.parse::<f64>() {
            return Ok(parsed);
        }
    }

    Err(ParseError::new("Element is not a double"))
}

/// Parses an unsigned integer.
pub fn parse_unsigned(element: &Value, variables: &Variables) -> Result<u64> {
    let value = parse_integer(element, variables)?;
    if value < 0 {
        return Err(ParseError::new("Element is not an unsigned integer"));
    }
    Ok(value as u64)
}

/// Parses an 8-bit unsigned integer.
pub fn parse_uint8(element: &Value, variables: &Variables) -> Result<u8> {
    let value = parse_integer(element, variables)?;
    if !(0..=u8::MAX as i64).contains(&value) {
        return Err(ParseError::new("Element is not an 8-bit unsigned integer"));
    }
    Ok(value as u8)
}

/// Parses a 16-bit unsigned integer.
pub fn parse_uint16(element: &Value, variables: &Variables) -> Result<u16> {
    let value = parse_integer(element, variables)?;
    if !(0..=u16::MAX as i64).contains(&value) {
        return Err(ParseError::new("Element is not a 16-bit unsigned integer"));
    }
    Ok(value as u16)
}

/// Parses an 8-bit signed integer.
pub fn parse_int8(element: &Value, variables: &Variables) -> Result<i8> {
    let value = parse_integer(element, variables)?;
    if !(i8::MIN as i64..=i8::MAX as i64).contains(&value) {
        return Err(ParseError::new("Element is not an 8-bit signed integer"));
    }
    Ok(value as i8)
}

/// Parses a bit position in the range 0-7.
pub fn parse_bit_position(element: &Value, variables: &Variables) -> Result<u8> {
    let value = parse_integer(element, variables)?;
    if !(0..=7).contains(&value) {
        return Err(ParseError::new("Element is not a bit position"));
    }
    Ok(value as u8)
}

/// Parses a bit value: 0 or 1.
pub fn parse_bit_value(element: &Value, variables: &Variables) -> Result<u8> {
    let value = parse_integer(element, variables)?;
    if !(0..=1).contains(&value) {
        return Err(ParseError::new("Element is not a bit value"));
    }
    Ok(value as u8)
}

/// Parses a byte value written as a quoted hex string.
///
/// JSON numbers have no hex form, so byte values like register addresses are
/// stored as strings: `0x` prefix followed by one or two hex digits.
pub fn parse_hex_byte(element: &Value, variables: &Variables) -> Result<u8> {
    let value = parse_string(element, true, variables)?;
    let is_hex = value.starts_with("0x")
        && value.len() > 2
        && value.len() < 5
        && value[2..].chars().all(|c| c.is_ascii_hexdigit());
    if !is_hex {
        return Err(ParseError::new("Element is not hexadecimal string"));
    }
    u8::from_str_radix(&value[2..], 16)
        .map_err(|_| ParseError::new("Element is not hexadecimal string"))
}

/// Parses an array of hex byte strings.
pub fn parse_hex_byte_array(element: &Value, variables: &Variables) -> Result<Vec<u8>> {
    verify_is_array(element)?;
    element
        .as_array()
        .unwrap()
        .iter()
        .map(|value| parse_hex_byte(value, variables))
        .collect()
}

/// Finds the configuration file for the current system.
///
/// The compatible system types are ordered from most to least specific. For
/// each type, first look for `<full type>.json`, then for
/// `<last dot-separated node>.json`. The first existing file wins.
pub fn find_config_file(compatible_system_types: &[String], config_dir: &Path) -> Option<PathBuf> {
    for system_type in compatible_system_types {
        let candidate = config_dir.join(format!("{system_type}.json"));
        if candidate.is_file() {
            return Some(candidate);
        }

        if let Some(last) = system_type.rsplit('.').next() {
            if last.len() < system_type.len() && !last.is_empty() {
                let candidate = config_dir.join(format!("{last}.json"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_variables() {
        let variables = vars(&[("bus", "3"), ("rail", "VDD_A")]);
        assert_eq!(
            expand_variables("${rail}_pgood", &variables).unwrap(),
            "VDD_A_pgood"
        );
        assert_eq!(expand_variables("${bus}${bus}", &variables).unwrap(), "33");
        assert_eq!(expand_variables("no vars", &variables).unwrap(), "no vars");

        let err = expand_variables("${missing}", &variables).unwrap_err();
        assert_eq!(err.0, "Undefined variable: missing");

        // Empty map: references pass through untouched
        assert_eq!(
            expand_variables("${missing}", no_variables()).unwrap(),
            "${missing}"
        );
    }

    #[test]
    fn test_parse_string() {
        assert_eq!(
            parse_string(&json!("abc"), false, no_variables()).unwrap(),
            "abc"
        );
        assert!(parse_string(&json!(""), false, no_variables()).is_err());
        assert_eq!(parse_string(&json!(""), true, no_variables()).unwrap(), "");
        assert!(parse_string(&json!(12), false, no_variables()).is_err());
    }

    #[test]
    fn test_parse_boolean() {
        assert!(parse_boolean(&json!(true), no_variables()).unwrap());
        assert!(!parse_boolean(&json!(false), no_variables()).unwrap());
        // String form only allowed with variables in play
        assert!(parse_boolean(&json!("true"), no_variables()).is_err());
        let variables = vars(&[("flag", "true")]);
        assert!(parse_boolean(&json!("${flag}"), &variables).unwrap());
        assert!(parse_boolean(&json!("maybe"), &variables).is_err());
    }

    #[test]
    fn test_parse_integer_via_variable() {
        let variables = vars(&[("line", "12")]);
        assert_eq!(parse_integer(&json!("${line}"), &variables).unwrap(), 12);
        // Fully consuming: trailing garbage rejected
        let variables = vars(&[("line", "12 ")]);
        assert!(parse_integer(&json!("${line}"), &variables).is_err());
        let variables = vars(&[("line", "0x0C")]);
        assert!(parse_integer(&json!("${line}"), &variables).is_err());
    }

    #[test]
    fn test_parse_int8_boundaries() {
        assert_eq!(parse_int8(&json!(-128), no_variables()).unwrap(), i8::MIN);
        assert_eq!(parse_int8(&json!(127), no_variables()).unwrap(), i8::MAX);
        assert!(parse_int8(&json!(-129), no_variables()).is_err());
        assert!(parse_int8(&json!(128), no_variables()).is_err());
    }

    #[test]
    fn test_parse_bit_position_and_value() {
        assert_eq!(parse_bit_position(&json!(0), no_variables()).unwrap(), 0);
        assert_eq!(parse_bit_position(&json!(7), no_variables()).unwrap(), 7);
        assert!(parse_bit_position(&json!(8), no_variables()).is_err());
        assert!(parse_bit_position(&json!(-1), no_variables()).is_err());

        assert_eq!(parse_bit_value(&json!(1), no_variables()).unwrap(), 1);
        assert!(parse_bit_value(&json!(2), no_variables()).is_err());
    }

    #[test]
    fn test_parse_hex_byte() {
        assert_eq!(parse_hex_byte(&json!("0x0"), no_variables()).unwrap(), 0);
        assert_eq!(
            parse_hex_byte(&json!("0xFF"), no_variables()).unwrap(),
            0xFF
        );
        assert_eq!(
            parse_hex_byte(&json!("0xab"), no_variables()).unwrap(),
            0xAB
        );
        assert_eq!(
            parse_hex_byte(&json!("0xA7"), no_variables()).unwrap(),
            0xA7
        );
        // Wrong length, prefix, or digits
        assert!(parse_hex_byte(&json!("0x"), no_variables()).is_err());
        assert!(parse_hex_byte(&json!("0x123"), no_variables()).is_err());
        assert!(parse_hex_byte(&json!("12"), no_variables()).is_err());
        assert!(parse_hex_byte(&json!("0xG1"), no_variables()).is_err());
    }

    #[test]
    fn test_parse_hex_byte_array() {
        assert_eq!(
            parse_hex_byte_array(&json!(["0x01", "0xFF"]), no_variables()).unwrap(),
            vec![0x01, 0xFF]
        );
        assert!(parse_hex_byte_array(&json!("0x01"), no_variables()).is_err());
    }

    #[test]
    fn test_verify_property_count() {
        let element = json!({"a": 1, "b": 2});
        assert!(verify_property_count(&element, 2).is_ok());
        assert!(verify_property_count(&element, 1).is_err());
    }

    #[test]
    fn test_required_property() {
        let element = json!({"name": "VDD"});
        assert!(required_property(&element, "name").is_ok());
        let err = required_property(&element, "page").unwrap_err();
        assert_eq!(err.0, "Required property missing: page");
    }

    #[test]
    fn test_find_config_file() {
        let dir = std::env::temp_dir().join("jsonutil_find_test");
        std::fs::create_dir_all(&dir).unwrap();
        let full = dir.join("com.acme.Hardware.Chassis.Model.MegaServer.json");
        std::fs::write(&full, "{}").unwrap();
        let short = dir.join("Server.json");
        std::fs::write(&short, "{}").unwrap();

        let types = vec![
            "com.acme.Hardware.Chassis.Model.MegaServer4CPU".to_string(),
            "com.acme.Hardware.Chassis.Model.MegaServer".to_string(),
            "com.acme.Hardware.Chassis.Model.Server".to_string(),
        ];
        // Full name match for the second entry wins before the third entry
        assert_eq!(find_config_file(&types, &dir), Some(full));

        let types = vec!["com.acme.Hardware.Chassis.Model.Server".to_string()];
        assert_eq!(find_config_file(&types, &dir), Some(short));

        let types = vec!["com.acme.Unknown".to_string()];
        assert_eq!(find_config_file(&types, &dir), None);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
