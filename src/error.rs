//! Error types for the meterd library.

use thiserror::Error;

use crate::protocol::ExceptionCode;

/// The main error type for meterd operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Serial port error.
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding/decoding error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Response rejected by the Modbus codec.
    #[error("modbus error: {0}")]
    Modbus(#[from] rmodbus::ErrorKind),

    /// The device answered with a Modbus exception.
    #[error("modbus exception {code} (function {function:#04x})")]
    Exception { function: u8, code: ExceptionCode },

    /// Response did not match the request.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Request timed out waiting for a response.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// Register operation is malformed.
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    /// Device has not been initialized yet.
    #[error("device not initialized")]
    NotInitialized,

    /// Device answered with data that is not usable.
    #[error("device error: {message}")]
    Device { message: String },

    /// Device already registered on a manager.
    #[error("duplicate device id {id}.{subdevice}")]
    DuplicateDevice { id: u8, subdevice: u8 },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Broadcaster has already stopped.
    #[error("broadcaster stopped")]
    BroadcasterStopped,
}

impl Error {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Frame-specific errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame too short to contain address, function and checksum.
    #[error("frame too short: need at least {min} bytes, got {got}")]
    TooShort { min: usize, got: usize },

    /// Frame payload exceeds maximum size.
    #[error("frame too large: {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// RTU response with a function code of unknown length.
    #[error("unknown function {0:#04x}")]
    UnknownFunction(u8),

    /// ASCII frame contained a non-hex character.
    #[error("invalid ascii frame: {reason}")]
    InvalidAscii { reason: String },

    /// MBAP header carried an unexpected protocol id.
    #[error("invalid protocol id {0}")]
    InvalidProtocolId(u16),
}

/// Result type alias for meterd operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_display() {
        let err = Error::from(FrameError::UnknownFunction(0x2B));
        assert_eq!(err.to_string(), "frame error: unknown function 0x2b");
    }

    #[test]
    fn test_error_display() {
        let err = Error::Exception {
            function: 4,
            code: ExceptionCode::SlaveDeviceBusy,
        };
        assert_eq!(
            err.to_string(),
            "modbus exception slave device busy (function 0x04)"
        );
    }
}
