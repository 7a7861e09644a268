//! PMBus data formats and the sysfs driver adapter.
//!
//! Covers the two linear data formats, VOUT_MODE parsing, the STATUS_VOUT
//! bit layout, and named reads against the files a PMBus device driver
//! exposes in sysfs.

use thiserror::Error;

mod sysfs;
pub use sysfs::SysfsPmbus;

/// PMBus command codes used by this application.
///
/// Names are uppercase to match the PMBus documentation.
pub const VOUT_MODE: u8 = 0x20;
pub const VOUT_COMMAND: u8 = 0x21;

/// STATUS_VOUT bits.
pub mod status_vout {
    pub const OV_FAULT: u8 = 0x80;
    pub const OV_WARNING: u8 = 0x40;
    pub const UV_WARNING: u8 = 0x20;
    pub const UV_FAULT: u8 = 0x10;
    pub const MAX_MIN_WARNING: u8 = 0x08;
    pub const TON_MAX_FAULT: u8 = 0x04;
    pub const TOFF_MAX_WARNING: u8 = 0x02;
    pub const TRACKING_ERROR: u8 = 0x01;

    /// Bits that never indicate a rail fault on their own.
    pub const WARNING_MASK: u8 = UV_WARNING | MAX_MIN_WARNING | TOFF_MAX_WARNING;
}

/// Failure of a PMBus operation.
#[derive(Debug, Clone, Error)]
pub enum PmbusError {
    #[error("Unable to read PMBus file {name}: {description}")]
    FileRead { name: String, description: String },

    #[error("PMBus file {name} does not contain a numeric value: {value}")]
    BadValue { name: String, value: String },

    #[error("No hwmon directory found under {path}")]
    NoHwmonDirectory { path: String },

    #[error(
        "VOUT_MODE contains unsupported data format: device: {device_id}, inventory path: {inventory_path}"
    )]
    UnsupportedFormat {
        device_id: String,
        inventory_path: String,
    },
}

/// Which of the driver's file trees a named read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileKind {
    /// Debugfs files such as `status<p>` and `status<p>_vout`.
    Debug,
    /// Hwmon files such as `in<N>_input` and `in<N>_label`.
    Hwmon,
    /// Device-level debugfs files such as `mfr_status`.
    HwmonDeviceDebug,
}

/// Named reads against the files a PMBus device driver exposes.
///
/// Numeric reads parse the file's ASCII contents, accepting decimal or
/// `0x`-prefixed hex. `hwmon_file_names` enumerates the hwmon directory so
/// callers can scan for voltage label files.
pub trait Pmbus: Send {
    fn read(&self, name: &str, kind: FileKind) -> Result<u64, PmbusError>;
    fn read_string(&self, name: &str, kind: FileKind) -> Result<String, PmbusError>;
    fn hwmon_file_names(&self) -> Result<Vec<String>, PmbusError>;
}

/// Data format selected by the VOUT_MODE mode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoutDataFormat {
    /// Two-byte unsigned mantissa with an out-of-band signed exponent.
    Linear,
    /// VID code format.
    Vid,
    /// Device-coefficient direct format.
    Direct,
    /// IEEE-754 half precision.
    Ieee,
}

impl VoutDataFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Vid => "vid",
            Self::Direct => "direct",
            Self::Ieee => "ieee",
        }
    }
}

/// Data format of a two-byte sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorDataFormat {
    /// 11-bit two's complement mantissa and 5-bit two's complement exponent,
    /// both stored in the value. Used for values unrelated to output
    /// voltage.
    Linear11,
    /// 16-bit unsigned mantissa; the exponent lives in VOUT_MODE or device
    /// documentation. Used for output-voltage values.
    Linear16,
}

impl SensorDataFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linear11 => "linear_11",
            Self::Linear16 => "linear_16",
        }
    }
}

/// Parses the one-byte VOUT_MODE value into data format and parameter.
///
/// Bits [6:5] select the format. Bits [4:0] hold the parameter; for the
/// linear format it is a sign-extended 5-bit two's complement exponent.
pub fn parse_vout_mode(value: u8) -> (VoutDataFormat, i8) {
    let format = match (value & 0b0110_0000) >> 5 {
        0b00 => VoutDataFormat::Linear,
        0b01 => VoutDataFormat::Vid,
        0b10 => VoutDataFormat::Direct,
        _ => VoutDataFormat::Ieee,
    };

    let mut parameter = value & 0b0001_1111;
    if format == VoutDataFormat::Linear && (parameter & 0b0001_0000) != 0 {
        parameter |= 0b1110_0000;
    }
    (format, parameter as i8)
}

/// Converts a linear-11 value to a decimal value.
pub fn convert_from_linear(value: u16) -> f64 {
    let mut exponent_field = (value >> 11) as u8;
    let mut mantissa_field = value & 0x07FF;

    if exponent_field > 0x0F {
        exponent_field |= 0xE0;
    }
    if mantissa_field > 0x03FF {
        mantissa_field |= 0xF800;
    }

    let exponent = exponent_field as i8;
    let mantissa = mantissa_field as i16;
    mantissa as f64 * 2f64.powi(exponent as i32)
}

/// Converts a vout-linear value to volts using the out-of-band exponent.
pub fn convert_from_vout_linear(value: u16, exponent: i8) -> f64 {
    value as f64 * 2f64.powi(exponent as i32)
}

/// Converts volts to the vout-linear format.
///
/// Rounds half away from zero. The volts value must not be negative.
pub fn convert_to_vout_linear(volts: f64, exponent: i8) -> u16 {
    let mantissa = volts / 2f64.powi(exponent as i32);
    mantissa.round() as u16
}
