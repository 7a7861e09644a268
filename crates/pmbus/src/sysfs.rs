//! Sysfs-backed PMBus adapter.
//!
//! A device bound to a PMBus driver exposes its files under
//! `/sys/bus/i2c/devices/<bus>-<addr>/hwmon/hwmonN` and the matching debugfs
//! tree `/sys/kernel/debug/pmbus/hwmonN`.

use crate::{FileKind, Pmbus, PmbusError};
use std::fs;
use std::path::PathBuf;

pub struct SysfsPmbus {
    device_path: PathBuf,
    debug_root: PathBuf,
    driver_name: String,
    instance: usize,
}

impl SysfsPmbus {
    pub fn new(bus: u8, address: u16, driver_name: &str, instance: usize) -> Self {
        Self {
            device_path: PathBuf::from(format!("/sys/bus/i2c/devices/{bus}-{address:04x}")),
            debug_root: PathBuf::from("/sys/kernel/debug/pmbus"),
            driver_name: driver_name.to_string(),
            instance,
        }
    }

    /// Override the sysfs and debugfs roots. Used by tests running against a
    /// temporary directory tree.
    pub fn with_roots(device_path: PathBuf, debug_root: PathBuf) -> Self {
        Self {
            device_path,
            debug_root,
            driver_name: String::new(),
            instance: 0,
        }
    }

    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    pub fn instance(&self) -> usize {
        self.instance
    }

    /// Locates the `hwmonN` directory for the device.
    fn hwmon_dir(&self) -> Result<PathBuf, PmbusError> {
        let hwmon_root = self.device_path.join("hwmon");
        let entries = fs::read_dir(&hwmon_root).map_err(|_| PmbusError::NoHwmonDirectory {
            path: self.device_path.display().to_string(),
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("hwmon") {
                return Ok(hwmon_root.join(name));
            }
        }
        Err(PmbusError::NoHwmonDirectory {
            path: self.device_path.display().to_string(),
        })
    }

    fn dir_for(&self, kind: FileKind) -> Result<PathBuf, PmbusError> {
        match kind {
            FileKind::Hwmon => self.hwmon_dir(),
            FileKind::Debug => {
                let hwmon = self.hwmon_dir()?;
                let name = hwmon.file_name().unwrap().to_string_lossy().into_owned();
                Ok(self.debug_root.join(name))
            }
            FileKind::HwmonDeviceDebug => {
                let hwmon = self.hwmon_dir()?;
                let name = hwmon.file_name().unwrap().to_string_lossy().into_owned();
                Ok(self.debug_root.join(name).join("device"))
            }
        }
    }

    fn read_file(&self, name: &str, kind: FileKind) -> Result<String, PmbusError> {
        let path = self.dir_for(kind)?.join(name);
        fs::read_to_string(&path).map_err(|e| PmbusError::FileRead {
            name: name.to_string(),
            description: format!("{}: {e}", path.display()),
        })
    }
}

/// Parses file contents as decimal or `0x`-prefixed hex.
pub(crate) fn parse_numeric(name: &str, contents: &str) -> Result<u64, PmbusError> {
    let value = contents.trim();
    let parsed = if let Some(hex) = value.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        value.parse::<u64>()
    };
    parsed.map_err(|_| PmbusError::BadValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl Pmbus for SysfsPmbus {
    fn read(&self, name: &str, kind: FileKind) -> Result<u64, PmbusError> {
        let contents = self.read_file(name, kind)?;
        parse_numeric(name, &contents)
    }

    fn read_string(&self, name: &str, kind: FileKind) -> Result<String, PmbusError> {
        Ok(self.read_file(name, kind)?.trim().to_string())
    }

    fn hwmon_file_names(&self) -> Result<Vec<String>, PmbusError> {
        let dir = self.hwmon_dir()?;
        let entries = fs::read_dir(&dir).map_err(|e| PmbusError::FileRead {
            name: dir.display().to_string(),
            description: e.to_string(),
        })?;
        Ok(entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect())
    }
}
