//! Function and exception codes of the register reads.

use std::fmt;

/// Maximum number of registers a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Bit set in the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Function codes used by the meter strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read holding registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Read input registers (0x04).
    ReadInputRegisters = 0x04,
}

impl FunctionCode {
    /// Converts a raw function code byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            _ => None,
        }
    }

    /// Returns the wire value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Exception codes carried by an exception response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Acknowledge,
    SlaveDeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetFailed,
    /// Code not defined by the Modbus application protocol.
    Unknown(u8),
}

impl ExceptionCode {
    /// Converts a raw exception code byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::SlaveDeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::SlaveDeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetFailed,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalFunction => f.write_str("illegal function"),
            Self::IllegalDataAddress => f.write_str("illegal data address"),
            Self::IllegalDataValue => f.write_str("illegal data value"),
            Self::SlaveDeviceFailure => f.write_str("slave device failure"),
            Self::Acknowledge => f.write_str("acknowledge"),
            Self::SlaveDeviceBusy => f.write_str("slave device busy"),
            Self::MemoryParityError => f.write_str("memory parity error"),
            Self::GatewayPathUnavailable => f.write_str("gateway path unavailable"),
            Self::GatewayTargetFailed => f.write_str("gateway target device failed to respond"),
            Self::Unknown(code) => write!(f, "unknown exception {code:#04x}"),
        }
    }
}
