//! Error types of the action engine.

use i2c::I2cError;
use jsonutil::ConfigFileError;
use pmbus::PmbusError;
use services::ServicesError;
use std::fmt;
use thiserror::Error;

/// A read-back after a write disagreed with the value written.
#[derive(Debug, Clone, Error)]
#[error("WriteVerificationError: {message}")]
pub struct WriteVerificationError {
    pub message: String,
    pub device_id: String,
    pub inventory_path: String,
}

/// The underlying cause of a failed action.
#[derive(Debug, Error)]
pub enum ErrorCause {
    #[error(transparent)]
    I2c(#[from] I2cError),

    #[error(transparent)]
    Pmbus(#[from] PmbusError),

    #[error(transparent)]
    WriteVerification(#[from] WriteVerificationError),

    #[error(transparent)]
    ConfigFile(#[from] ConfigFileError),

    #[error("{0}")]
    DBus(String),

    #[error("{0}")]
    Internal(String),
}

impl From<ServicesError> for ErrorCause {
    fn from(error: ServicesError) -> Self {
        // Facade failures reach the hardware services over D-Bus
        Self::DBus(error.to_string())
    }
}

/// An error that occurred while executing an action.
///
/// Describes the action that failed; the low-level cause is kept so the
/// error-logging pipeline can classify it.
#[derive(Debug)]
pub struct ActionError {
    action: String,
    detail: Option<String>,
    cause: Option<ErrorCause>,
}

impl ActionError {
    /// Creates an error for the given action description.
    pub fn new(action: impl ToString) -> Self {
        Self {
            action: action.to_string(),
            detail: None,
            cause: None,
        }
    }

    pub fn with_detail(action: impl ToString, detail: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            detail: Some(detail.into()),
            cause: None,
        }
    }

    pub fn with_cause(action: impl ToString, cause: impl Into<ErrorCause>) -> Self {
        Self {
            action: action.to_string(),
            detail: None,
            cause: Some(cause.into()),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActionError: {}", self.action)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ActionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}
