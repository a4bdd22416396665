//! Error taxonomy shared by every device driver and the command interpreter.
//!
//! `LabError` is the single error type crossing the driver boundary. Each
//! variant maps onto one failure class of the bench:
//!
//! - **`Connection`**: the transport could not be opened, or the device did not
//!   answer its handshake probe.
//! - **`NoResponse`**: a request timed out, or the device returned nothing.
//! - **`Validation`**: input was out of range or malformed and was rejected
//!   before any byte went on the wire.
//! - **`Checksum`** / **`Parse`**: a device reply cannot be trusted.
//! - **`NotFound`**: a device id or category could not be resolved.
//! - **`Duplicate`**: a registry name collision.
//! - **`Hardware`**: the device itself reported an error condition.
//!
//! The dispatcher uses [`LabError::is_recoverable`] to decide whether a failed
//! command is logged and skipped or aborts the run.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results crossing the driver boundary.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for bench devices and the command interpreter.
#[derive(Error, Debug)]
pub enum LabError {
    /// Transport open or handshake failure.
    ///
    /// Raised by `connect()` when the port cannot be opened or the device stays
    /// silent on its probe, and by any operation attempted on a closed link.
    ///
    /// **Recovery Strategy**: check cabling and port assignment, then reconnect.
    #[error("connection error on '{device}': {message}")]
    Connection {
        /// Device instance name
        device: String,
        /// What went wrong
        message: String,
    },

    /// The device did not answer within the bounded request time.
    ///
    /// Every read on a serial link is wrapped in a timeout. An empty reply or an
    /// end-of-stream while waiting is reported the same way.
    #[error("no response from '{device}' within {timeout:?} (command {command:?})")]
    NoResponse {
        /// Device instance name
        device: String,
        /// Command that was waiting for a reply
        command: String,
        /// Configured request timeout
        timeout: Duration,
    },

    /// Input rejected locally, before any I/O.
    ///
    /// Out-of-range positions, set points outside the safe band, non-positive
    /// rates, unknown rack types and malformed command parameters all land here.
    ///
    /// **Recovery Strategy**: caught at the dispatcher boundary, logged, and the
    /// run continues.
    #[error("validation error: {0}")]
    Validation(String),

    /// A reply's integrity code did not match its payload.
    #[error("checksum mismatch from '{device}': expected {expected:02x}, received {received}")]
    Checksum {
        /// Device instance name
        device: String,
        /// Checksum computed over the received payload
        expected: u8,
        /// Checksum field as received
        received: String,
    },

    /// A reply arrived but could not be interpreted.
    #[error("unexpected reply from '{device}': {message}")]
    Parse {
        /// Device instance name
        device: String,
        /// Description including the raw reply
        message: String,
    },

    /// A device id or category could not be resolved.
    ///
    /// **Recovery Strategy**: caught at the dispatcher boundary, logged, and the
    /// run continues.
    #[error("not found: {0}")]
    NotFound(String),

    /// A registry name is already taken within its category.
    #[error("device '{name}' is already registered in category '{category}'")]
    Duplicate {
        /// Registry category
        category: String,
        /// Colliding instance name
        name: String,
    },

    /// The device reported an error condition of its own.
    #[error("device '{device}' reported an error: {message}")]
    Hardware {
        /// Device instance name
        device: String,
        /// Device-reported message
        message: String,
    },

    /// Standard I/O failure on the transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LabError {
    /// Build a [`LabError::Connection`].
    pub fn connection(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`LabError::Parse`].
    pub fn parse(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`LabError::Hardware`].
    pub fn hardware(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hardware {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Build a [`LabError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Build a [`LabError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Whether the dispatcher may log this error and keep sequencing commands.
    ///
    /// Only validation and resolution failures qualify: they are raised before
    /// any device state changed. Everything else may leave a device in an
    /// unknown state and aborts the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound(_))
    }

    /// Short machine-friendly label, used as a structured logging field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::NoResponse { .. } => "no_response",
            Self::Validation(_) => "validation",
            Self::Checksum { .. } => "checksum",
            Self::Parse { .. } => "parse",
            Self::NotFound(_) => "not_found",
            Self::Duplicate { .. } => "duplicate",
            Self::Hardware { .. } => "hardware",
            Self::Io(_) => "io",
        }
    }
}
