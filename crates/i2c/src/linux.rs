//! Linux `/dev/i2c-N` implementation using the SMBus ioctl interface.

use crate::{BlockMode, I2c, I2cError, MAX_BLOCK_LEN};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use tracing::debug;

const I2C_SLAVE: libc::c_ulong = 0x0703;
const I2C_SMBUS: libc::c_ulong = 0x0720;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;

const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;
const I2C_SMBUS_BLOCK_DATA: u32 = 5;
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;

/// Block buffer: one length byte plus the payload and a trailing PEC slot.
const I2C_SMBUS_BLOCK_MAX: usize = MAX_BLOCK_LEN;

#[repr(C)]
union I2cSmbusData {
    byte: u8,
    word: u16,
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

/// One device on one `/dev/i2c-N` bus.
pub struct LinuxI2c {
    bus: u8,
    address: u16,
    file: Option<File>,
}

impl LinuxI2c {
    pub fn new(bus: u8, address: u16) -> Self {
        Self {
            bus,
            address,
            file: None,
        }
    }

    fn device_path(&self) -> String {
        format!("/dev/i2c-{}", self.bus)
    }

    fn fd(&self) -> Result<i32, I2cError> {
        match &self.file {
            Some(file) => Ok(file.as_raw_fd()),
            None => Err(I2cError::NotOpen {
                bus: self.bus,
                address: self.address,
            }),
        }
    }

    fn transaction_error(&self, what: &str) -> I2cError {
        let errno = std::io::Error::last_os_error();
        I2cError::Transaction {
            bus: self.bus,
            address: self.address,
            description: format!("{what}: {errno}"),
        }
    }

    fn smbus_transfer(
        &self,
        read_write: u8,
        command: u8,
        size: u32,
        data: &mut I2cSmbusData,
    ) -> Result<(), I2cError> {
        let fd = self.fd()?;
        let mut args = I2cSmbusIoctlData {
            read_write,
            command,
            size,
            data: data as *mut I2cSmbusData,
        };
        // SAFETY: fd is a valid open descriptor and args points at a
        // properly sized i2c_smbus_ioctl_data structure for this request.
        let rc = unsafe { libc::ioctl(fd, I2C_SMBUS, &mut args) };
        if rc < 0 {
            let op = if read_write == I2C_SMBUS_READ {
                "read"
            } else {
                "write"
            };
            return Err(self.transaction_error(op));
        }
        Ok(())
    }
}

impl I2c for LinuxI2c {
    fn open(&mut self) -> Result<(), I2cError> {
        let path = self.device_path();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| I2cError::Open {
                path: path.clone(),
                description: e.to_string(),
            })?;
        // SAFETY: the descriptor is valid and I2C_SLAVE takes a plain long.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), I2C_SLAVE, self.address as libc::c_ulong) };
        if rc < 0 {
            return Err(I2cError::Open {
                path,
                description: std::io::Error::last_os_error().to_string(),
            });
        }
        debug!(bus = self.bus, address = self.address, "I2C device opened");
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        self.file = None;
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn bus(&self) -> u8 {
        self.bus
    }

    fn address(&self) -> u16 {
        self.address
    }

    fn read_byte(&mut self, register: u8) -> Result<u8, I2cError> {
        let mut data = I2cSmbusData { byte: 0 };
        self.smbus_transfer(I2C_SMBUS_READ, register, I2C_SMBUS_BYTE_DATA, &mut data)?;
        // SAFETY: the kernel filled the byte member for BYTE_DATA.
        Ok(unsafe { data.byte })
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<(), I2cError> {
        let mut data = I2cSmbusData { byte: value };
        self.smbus_transfer(I2C_SMBUS_WRITE, register, I2C_SMBUS_BYTE_DATA, &mut data)
    }

    fn read_word(&mut self, register: u8) -> Result<u16, I2cError> {
        let mut data = I2cSmbusData { word: 0 };
        self.smbus_transfer(I2C_SMBUS_READ, register, I2C_SMBUS_WORD_DATA, &mut data)?;
        // SAFETY: the kernel filled the word member for WORD_DATA.
        Ok(unsafe { data.word })
    }

    fn write_word(&mut self, register: u8, value: u16) -> Result<(), I2cError> {
        let mut data = I2cSmbusData { word: value };
        self.smbus_transfer(I2C_SMBUS_WRITE, register, I2C_SMBUS_WORD_DATA, &mut data)
    }

    fn read_block(
        &mut self,
        register: u8,
        count: u8,
        mode: BlockMode,
    ) -> Result<Vec<u8>, I2cError> {
        if count as usize > MAX_BLOCK_LEN || (mode == BlockMode::I2c && count == 0) {
            return Err(I2cError::InvalidBlockLength {
                bus: self.bus,
                address: self.address,
                len: count as usize,
            });
        }
        let mut data = I2cSmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        };
        let size = match mode {
            BlockMode::SmBus => I2C_SMBUS_BLOCK_DATA,
            BlockMode::I2c => {
                // For I2C block transfers the requested length goes in the
                // first buffer byte.
                // SAFETY: writing the length slot of the block member.
                unsafe { data.block[0] = count };
                I2C_SMBUS_I2C_BLOCK_DATA
            }
        };
        self.smbus_transfer(I2C_SMBUS_READ, register, size, &mut data)?;
        // SAFETY: the kernel filled the block member; block[0] is the length.
        let block = unsafe { &data.block };
        let len = (block[0] as usize).min(MAX_BLOCK_LEN);
        Ok(block[1..=len].to_vec())
    }

    fn write_block(
        &mut self,
        register: u8,
        values: &[u8],
        mode: BlockMode,
    ) -> Result<(), I2cError> {
        if values.is_empty() || values.len() > MAX_BLOCK_LEN {
            return Err(I2cError::InvalidBlockLength {
                bus: self.bus,
                address: self.address,
                len: values.len(),
            });
        }
        let mut data = I2cSmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        };
        // SAFETY: writing the length and payload slots of the block member.
        unsafe {
            data.block[0] = values.len() as u8;
            data.block[1..=values.len()].copy_from_slice(values);
        }
        let size = match mode {
            BlockMode::SmBus => I2C_SMBUS_BLOCK_DATA,
            BlockMode::I2c => I2C_SMBUS_I2C_BLOCK_DATA,
        };
        self.smbus_transfer(I2C_SMBUS_WRITE, register, size, &mut data)
    }
}
