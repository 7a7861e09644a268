//! Error-logging pipeline.
//!
//! Inspects an error's cause chain, picks the highest-priority cause, and
//! logs a typed event through the services facade. An [`ErrorHistory`]
//! deduplicates by error kind so one bad device does not flood the event
//! log; callers choose the scope, typically one history per monitoring
//! pass.

use crate::error::ErrorCause;
use i2c::I2cError;
use jsonutil::ConfigFileError;
use pmbus::PmbusError;
use services::{AdditionalData, Services};
use std::error::Error;
use types::Severity;

/// Kinds of errors the pipeline can log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorType {
    ConfigFile,
    DBus,
    I2c,
    Internal,
    Pmbus,
    WriteVerification,
}

const ERROR_TYPE_COUNT: usize = 6;

/// Which error kinds have already been logged in the current context.
#[derive(Debug, Default, Clone)]
pub struct ErrorHistory {
    logged: [bool; ERROR_TYPE_COUNT],
}

impl ErrorHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_logged(&self, error_type: ErrorType) -> bool {
        self.logged[error_type as usize]
    }

    pub fn set_was_logged(&mut self, error_type: ErrorType, logged: bool) {
        self.logged[error_type as usize] = logged;
    }

    pub fn clear(&mut self) {
        self.logged = [false; ERROR_TYPE_COUNT];
    }
}

/// Event message names by error kind.
fn event_message(error_type: ErrorType) -> &'static str {
    match error_type {
        ErrorType::ConfigFile => "xyz.openbmc_project.Power.Regulators.Error.ConfigFile",
        ErrorType::DBus => "xyz.openbmc_project.Power.Error.DBus",
        ErrorType::I2c => "xyz.openbmc_project.Power.Error.I2C",
        ErrorType::Internal => "xyz.openbmc_project.Power.Error.Internal",
        ErrorType::Pmbus => "xyz.openbmc_project.Power.Error.PMBus",
        ErrorType::WriteVerification => {
            "xyz.openbmc_project.Power.Regulators.Error.WriteVerification"
        }
    }
}

/// Classification priority. High for hardware and configuration failures,
/// medium for D-Bus, low for everything else.
fn priority(error_type: ErrorType) -> u8 {
    match error_type {
        ErrorType::ConfigFile
        | ErrorType::Pmbus
        | ErrorType::WriteVerification
        | ErrorType::I2c => 2,
        ErrorType::DBus => 1,
        ErrorType::Internal => 0,
    }
}

fn classify(error: &(dyn Error + 'static)) -> ErrorType {
    if error.downcast_ref::<ConfigFileError>().is_some() {
        return ErrorType::ConfigFile;
    }
    if error.downcast_ref::<PmbusError>().is_some() {
        return ErrorType::Pmbus;
    }
    if error.downcast_ref::<I2cError>().is_some() {
        return ErrorType::I2c;
    }
    if error
        .downcast_ref::<crate::error::WriteVerificationError>()
        .is_some()
    {
        return ErrorType::WriteVerification;
    }
    if let Some(cause) = error.downcast_ref::<ErrorCause>() {
        return match cause {
            ErrorCause::I2c(_) => ErrorType::I2c,
            ErrorCause::Pmbus(_) => ErrorType::Pmbus,
            ErrorCause::WriteVerification(_) => ErrorType::WriteVerification,
            ErrorCause::ConfigFile(_) => ErrorType::ConfigFile,
            ErrorCause::DBus(_) => ErrorType::DBus,
            ErrorCause::Internal(_) => ErrorType::Internal,
        };
    }
    ErrorType::Internal
}

/// Selects the error to log from the cause chain.
///
/// Walks innermost to outermost and picks the outermost link holding the
/// highest priority seen.
fn error_to_log<'a>(error: &'a (dyn Error + 'static)) -> &'a (dyn Error + 'static) {
    let mut chain = vec![error];
    let mut current = error;
    while let Some(source) = current.source() {
        chain.push(source);
        current = source;
    }

    let mut selected = error;
    let mut highest_priority_found = -1i16;
    for link in chain.into_iter().rev() {
        let link_priority = priority(classify(link)) as i16;
        if link_priority >= highest_priority_found {
            highest_priority_found = link_priority;
            selected = link;
        }
    }
    selected
}

/// Attaches typed detail from the selected error.
fn additional_data(error: &(dyn Error + 'static)) -> AdditionalData {
    let mut data = AdditionalData::new();
    data.insert("ERROR_MESSAGE".to_string(), error.to_string());

    match error.downcast_ref::<ErrorCause>() {
        Some(ErrorCause::I2c(e)) => {
            if let Some(bus) = e.bus() {
                data.insert("CALLOUT_IIC_BUS".to_string(), bus.to_string());
            }
            if let Some(address) = e.address() {
                data.insert("CALLOUT_IIC_ADDR".to_string(), format!("{address:#x}"));
            }
        }
        Some(ErrorCause::Pmbus(PmbusError::UnsupportedFormat { inventory_path, .. })) => {
            data.insert("INVENTORY_PATH".to_string(), inventory_path.clone());
        }
        Some(ErrorCause::WriteVerification(e)) => {
            data.insert("INVENTORY_PATH".to_string(), e.inventory_path.clone());
        }
        Some(ErrorCause::ConfigFile(e)) => {
            data.insert("PATH".to_string(), e.path.display().to_string());
        }
        _ => {}
    }
    data
}

/// Logs an error event for the highest-priority cause in the chain, unless
/// an error of the same kind was already logged in this history.
pub fn log_error(
    error: &(dyn Error + 'static),
    severity: Severity,
    services: &mut dyn Services,
    history: &mut ErrorHistory,
) {
    let selected = error_to_log(error);
    let error_type = classify(selected);

    if history.was_logged(error_type) {
        return;
    }
    history.set_was_logged(error_type, true);

    services.log_event(event_message(error_type), severity, additional_data(selected));
}
