//! Shared types for the voltage regulation daemon.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Last requested power state of a system or chassis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Off,
    On,
}

impl PowerState {
    /// Integer representation used on the control surface (1 = on).
    pub fn as_int(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }

    /// Parse the control-surface integer. Values other than 0/1 are invalid.
    pub fn from_int(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            _ => None,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
        }
    }
}

/// Observed power-good condition of a system, chassis, or device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerGood {
    Off,
    On,
}

impl PowerGood {
    pub fn as_int(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }
}

impl fmt::Display for PowerGood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::On => write!(f, "on"),
        }
    }
}

/// Voltage regulator sensor type.
///
/// The peak/valley variants track extremes observed by the regulator itself,
/// which polls far faster than the monitoring cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorType {
    Iout,
    IoutPeak,
    IoutValley,
    Pout,
    Temperature,
    TemperaturePeak,
    Vout,
    VoutPeak,
    VoutValley,
}

impl SensorType {
    /// Name used in configuration files and in external sensor names.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Iout => "iout",
            Self::IoutPeak => "iout_peak",
            Self::IoutValley => "iout_valley",
            Self::Pout => "pout",
            Self::Temperature => "temperature",
            Self::TemperaturePeak => "temperature_peak",
            Self::Vout => "vout",
            Self::VoutPeak => "vout_peak",
            Self::VoutValley => "vout_valley",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "iout" => Some(Self::Iout),
            "iout_peak" => Some(Self::IoutPeak),
            "iout_valley" => Some(Self::IoutValley),
            "pout" => Some(Self::Pout),
            "temperature" => Some(Self::Temperature),
            "temperature_peak" => Some(Self::TemperaturePeak),
            "vout" => Some(Self::Vout),
            "vout_peak" => Some(Self::VoutPeak),
            "vout_valley" => Some(Self::VoutValley),
            _ => None,
        }
    }
}

impl fmt::Display for SensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a logged error event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Informational,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Informational => write!(f, "informational"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Formats values as `[v0, v1, ...]` for journal and event data.
pub fn format_list<T: fmt::Display>(values: &[T]) -> String {
    let mut out = String::from("[");
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_round_trip() {
        assert_eq!(PowerState::from_int(1), Some(PowerState::On));
        assert_eq!(PowerState::from_int(0), Some(PowerState::Off));
        assert_eq!(PowerState::from_int(2), None);
        assert_eq!(PowerState::from_int(-1), None);
        assert_eq!(PowerState::On.as_int(), 1);
        assert_eq!(PowerState::Off.to_string(), "off");
    }

    #[test]
    fn test_sensor_type_names() {
        for type_ in [
            SensorType::Iout,
            SensorType::IoutPeak,
            SensorType::IoutValley,
            SensorType::Pout,
            SensorType::Temperature,
            SensorType::TemperaturePeak,
            SensorType::Vout,
            SensorType::VoutPeak,
            SensorType::VoutValley,
        ] {
            assert_eq!(SensorType::from_str(type_.as_str()), Some(type_));
        }
        assert_eq!(SensorType::from_str("vin"), None);
        assert_eq!(SensorType::TemperaturePeak.as_str(), "temperature_peak");
    }

    #[test]
    fn test_sensor_type_serde_uses_config_names() {
        assert_eq!(
            serde_json::to_string(&SensorType::VoutPeak).unwrap(),
            "\"vout_peak\""
        );
        let parsed: SensorType = serde_json::from_str("\"iout_valley\"").unwrap();
        assert_eq!(parsed, SensorType::IoutValley);
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list::<i32>(&[]), "[]");
        assert_eq!(format_list(&[1]), "[1]");
        assert_eq!(format_list(&[1, 0, 1]), "[1, 0, 1]");
    }
}
