//! I2C transport for PMBus regulators and sequencer devices.
//!
//! On Linux, talks to `/dev/i2c-N` through the SMBus ioctl interface. The
//! register-map simulation used by tests lives in the `sim` crate.

use thiserror::Error;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxI2c;

/// Transfer mode for multi-byte transactions.
///
/// SMBus block transfers carry the byte count in the wire format; I2C block
/// transfers move exactly the number of bytes the caller specifies. All the
/// multi-byte action primitives use the explicit-size I2C mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    SmBus,
    I2c,
}

/// Largest payload of a single block transaction.
pub const MAX_BLOCK_LEN: usize = 32;

/// Transport-level I2C failure.
#[derive(Debug, Clone, Error)]
pub enum I2cError {
    #[error("Failed to open I2C device {path}: {description}")]
    Open { path: String, description: String },

    #[error("I2C transaction failed: bus {bus}, address 0x{address:02X}: {description}")]
    Transaction {
        bus: u8,
        address: u16,
        description: String,
    },

    #[error("I2C device not open: bus {bus}, address 0x{address:02X}")]
    NotOpen { bus: u8, address: u16 },

    #[error("Invalid block length {len}: bus {bus}, address 0x{address:02X}")]
    InvalidBlockLength { bus: u8, address: u16, len: usize },
}

impl I2cError {
    /// I2C bus number the failed transaction targeted, when known.
    pub fn bus(&self) -> Option<u8> {
        match self {
            Self::Open { .. } => None,
            Self::Transaction { bus, .. }
            | Self::NotOpen { bus, .. }
            | Self::InvalidBlockLength { bus, .. } => Some(*bus),
        }
    }

    /// Device address the failed transaction targeted, when known.
    pub fn address(&self) -> Option<u16> {
        match self {
            Self::Open { .. } => None,
            Self::Transaction { address, .. }
            | Self::NotOpen { address, .. }
            | Self::InvalidBlockLength { address, .. } => Some(*address),
        }
    }
}

/// Byte, word, and block access to one device on one I2C bus.
///
/// Callers must only call `open` when `!is_open`. `close` is safe to call on
/// a closed handle and never fails. Word values use the PMBus little-endian
/// convention. Callers do not retry at this layer.
pub trait I2c: Send {
    fn open(&mut self) -> Result<(), I2cError>;
    fn close(&mut self);
    fn is_open(&self) -> bool;

    fn bus(&self) -> u8;
    fn address(&self) -> u16;

    fn read_byte(&mut self, register: u8) -> Result<u8, I2cError>;
    fn write_byte(&mut self, register: u8, value: u8) -> Result<(), I2cError>;

    fn read_word(&mut self, register: u8) -> Result<u16, I2cError>;
    fn write_word(&mut self, register: u8, value: u16) -> Result<(), I2cError>;

    /// Reads `count` bytes. In SMBus mode the device supplies the length and
    /// `count` is an upper bound.
    fn read_block(&mut self, register: u8, count: u8, mode: BlockMode)
        -> Result<Vec<u8>, I2cError>;
    fn write_block(&mut self, register: u8, data: &[u8], mode: BlockMode)
        -> Result<(), I2cError>;
}
