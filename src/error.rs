//! Custom error types for the crate.
//!
//! `SilverpakError` only carries contract violations and configuration
//! problems. Serial flakiness never shows up here: the transport absorbs it
//! into `bool`/`Option` results, discovery turns it into a port status, and
//! the position poller reports a lost device through
//! [`MotorEvent::ConnectionLost`](crate::hardware::controller::MotorEvent).
//!
//! ## Error Hierarchy
//!
//! - **`InvalidOperationState`**: an operation was called while the motor state
//!   forbids it. No I/O was performed.
//! - **`ArgumentInvalid`**: a required connection setting was left unset.
//! - **`DeviceMisbehavior`**: the firmware ran away during home calibration.
//!   Fatal for the controller instance; the operator has to restart.
//! - **`Config`** / **`Configuration`**: loading or validating configuration.
//! - **`Io`**: file and terminal I/O in the configuration and CLI surfaces.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, SilverpakError>;

/// Errors surfaced to callers of the control core.
#[derive(Error, Debug)]
pub enum SilverpakError {
    /// The call is not valid in the current motor or port state.
    #[error("Invalid operation: {0}")]
    InvalidOperationState(String),

    /// A required setting is missing or out of range.
    #[error("Invalid argument: {0}")]
    ArgumentInvalid(String),

    /// Unrecoverable device behaviour; the controller refuses further commands.
    #[error("Device misbehavior: {0}. Restart the program")]
    DeviceMisbehavior(String),

    /// Configuration could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O failure outside the serial transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SilverpakError {
    /// Shorthand for [`SilverpakError::InvalidOperationState`].
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SilverpakError::InvalidOperationState(msg.into())
    }

    /// True when the caller may retry after fixing state or settings.
    pub fn can_recover(&self) -> bool {
        !matches!(self, SilverpakError::DeviceMisbehavior(_))
    }
}

impl From<figment::Error> for SilverpakError {
    fn from(value: figment::Error) -> Self {
        SilverpakError::Config(Box::new(value))
    }
}
