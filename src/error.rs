//! Error types for controller communication and adaptive control.
//!
//! All errors implement [`std::error::Error`] with structured context: the
//! device and command a failure belongs to travel inside the error rather than
//! in free-form strings, so callers can log, classify, and decide on retries
//! without parsing messages.
//!
//! ## Error Categories
//!
//! - **Connection errors**: socket establishment, reconnect, and I/O failures
//! - **Framing errors**: checksum/marker/length/address mismatches on the wire
//! - **Codec errors**: payload encode/decode problems
//! - **Timeouts**: no correlated reply inside the configured window
//! - **Device rejections**: NAK frames and negative command results (0F81)
//! - **Verification failures**: echoed plan parameters differ from what was sent
//!
//! ## Retry Classification
//!
//! ```rust
//! use greenwave::SignalError;
//!
//! let error = SignalError::device_unreachable("TC-0001");
//! assert!(error.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T, E = SignalError> = std::result::Result<T, E>;

/// Wire-level validation failure codes, power-of-two so a future revision can
/// OR-combine them. `validate()` reports only the first failing check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameErrorCode {
    /// XOR checksum over the frame body does not match the final byte.
    Checksum = 1,
    /// Start/footer delimiters are missing or malformed.
    Frame = 2,
    /// Declared length differs from the byte count actually received.
    Length = 4,
    /// Declared device address differs from the configured protocol address.
    Address = 8,
}

impl FrameErrorCode {
    /// Decode a wire error code (as carried in a NAK payload).
    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Checksum),
            2 => Some(Self::Frame),
            4 => Some(Self::Length),
            8 => Some(Self::Address),
            _ => None,
        }
    }

    /// Human-readable label matching the device vendor's documentation.
    pub fn description(self) -> &'static str {
        match self {
            Self::Checksum => "Checksum error",
            Self::Frame => "Frame error",
            Self::Length => "Length error",
            Self::Address => "Address error",
        }
    }
}

/// Main error type for controller operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum SignalError {
    #[error("Failed to connect to controller {device}: {reason}")]
    Connection {
        device: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error on connection to {device}")]
    Io {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Controller {device} is not connected")]
    DeviceUnreachable { device: String },

    #[error("Unknown device: {id}")]
    DeviceNotFound { id: String },

    #[error("Invalid frame from {device}: {} ({detail})", code.description())]
    InvalidFrame { device: String, code: FrameErrorCode, detail: String },

    #[error("Encode error for command {command}: {details}")]
    Encode { command: String, details: String },

    #[error("Decode error in {context}: {details}")]
    Decode { context: String, details: String },

    #[error("No reply from {device} for command {command} within {timeout:?}")]
    Timeout { device: String, command: String, timeout: Duration },

    #[error("Controller {device} replied NAK to {command}: {}", code.description())]
    Nak { device: String, command: String, code: FrameErrorCode },

    #[error(
        "Controller {device} rejected {command}: error code {error_code:#04x}, parameter {parameter_number}"
    )]
    Rejected { device: String, command: String, error_code: u8, parameter_number: u8 },

    #[error("Command {command} to {device} failed after {attempts} attempts")]
    RetriesExhausted { device: String, command: String, attempts: u32 },

    #[error("Plan verification failed for {device}: {}", mismatches.join("; "))]
    Verification { device: String, mismatches: Vec<String> },

    #[error("Invalid rule {context}: {details}")]
    Rule { context: String, details: String },

    #[error("Configuration error: {details}")]
    Config { details: String },
}

impl SignalError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// Framing and codec errors are deterministic for a given frame and never
    /// retried by the layer that detected them; the peer that sent the frame
    /// owns the retry. Timeouts, NAKs, rejections, and connection failures are
    /// worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            SignalError::Connection { .. } => true,
            SignalError::Io { .. } => true,
            SignalError::DeviceUnreachable { .. } => true,
            SignalError::Timeout { .. } => true,
            SignalError::Nak { .. } => true,
            SignalError::Rejected { .. } => true,
            SignalError::DeviceNotFound { .. } => false,
            SignalError::InvalidFrame { .. } => false,
            SignalError::Encode { .. } => false,
            SignalError::Decode { .. } => false,
            SignalError::RetriesExhausted { .. } => false,
            SignalError::Verification { .. } => false,
            SignalError::Rule { .. } => false,
            SignalError::Config { .. } => false,
        }
    }

    /// Helper constructor for connection failures without a source error.
    pub fn connection_failed(device: impl Into<String>, reason: impl Into<String>) -> Self {
        SignalError::Connection { device: device.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for connection failures with a source error.
    pub fn connection_failed_with_source(
        device: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        SignalError::Connection { device: device.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for I/O failures tied to a device connection.
    pub fn io_error(device: impl Into<String>, source: std::io::Error) -> Self {
        SignalError::Io { device: device.into(), source }
    }

    /// Helper constructor for an unreachable (not currently connected) device.
    pub fn device_unreachable(device: impl Into<String>) -> Self {
        SignalError::DeviceUnreachable { device: device.into() }
    }

    /// Helper constructor for decode failures.
    pub fn decode_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        SignalError::Decode { context: context.into(), details: details.into() }
    }

    /// Helper constructor for correlation timeouts.
    pub fn timeout(
        device: impl Into<String>,
        command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        SignalError::Timeout { device: device.into(), command: command.into(), timeout }
    }
}
