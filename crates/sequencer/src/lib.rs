//! Chassis power sequencing and pgood fault detection.
//!
//! A system contains chassis; each chassis contains power sequencer devices;
//! each device enables and monitors voltage rails. The system and chassis
//! state machines drive power on/off requests and a periodic monitor tick;
//! when a rail fails to come up or drops out, the device-level fault
//! detection identifies the root-cause rail and captures diagnostic data.

use thiserror::Error;

mod chassis;
pub mod config;
mod device;
mod rail;
mod system;
#[cfg(test)]
pub(crate) mod testutil;

pub use chassis::{Chassis, DEFAULT_PGOOD_TIMEOUT};
pub use device::{
    find_pgood_fault, PowerSequencerDevice, Ucd90160, Ucd90320, Ucd90x,
    POWER_SEQUENCER_VOLTAGE_FAULT,
};
pub use rail::{Gpio, Rail};
pub use system::System;

/// Error raised by the sequencing state machines and devices.
#[derive(Debug, Error)]
pub enum Error {
    #[error("System monitoring has not been initialized")]
    SystemMonitoringNotInitialized,

    #[error("System power state could not be obtained")]
    SystemPowerStateUnknown,

    #[error("System power good could not be obtained")]
    SystemPowerGoodUnknown,

    #[error("Monitoring not initialized for chassis {0}")]
    MonitoringNotInitialized(usize),

    #[error("Power state could not be obtained for chassis {0}")]
    ChassisPowerStateUnknown(usize),

    #[error("Power good could not be obtained for chassis {0}")]
    ChassisPowerGoodUnknown(usize),

    #[error("{0}")]
    Failed(String),
}

impl Error {
    /// Builds the catch-all variant from a formatted message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
