//! Register byte decoding.
//!
//! Registers arrive big-endian. "Swapped" encodings carry the low word
//! first, as some meters do for 32-bit values.

use crate::error::{Error, Result};

/// Binary layout of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Float32,
    Float32Swapped,
    Uint16,
    Uint32,
    Uint32Swapped,
    Uint64,
    Int16,
    Int32,
    Int32Swapped,
    Int64,
}

impl Encoding {
    /// Number of bytes consumed.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::Uint16 | Self::Int16 => 2,
            Self::Float32
            | Self::Float32Swapped
            | Self::Uint32
            | Self::Uint32Swapped
            | Self::Int32
            | Self::Int32Swapped => 4,
            Self::Uint64 | Self::Int64 => 8,
        }
    }

    /// Returns true for signed integer encodings.
    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int16 | Self::Int32 | Self::Int32Swapped | Self::Int64
        )
    }

    /// Decodes the leading bytes of `b`.
    ///
    /// # Errors
    ///
    /// Returns a device error if `b` is shorter than [`size`](Self::size).
    #[allow(clippy::cast_precision_loss)]
    pub fn decode(self, b: &[u8]) -> Result<f64> {
        let Some(b) = b.get(..self.size()) else {
            return Err(Error::Device {
                message: format!(
                    "{self:?} needs {} bytes, got {}",
                    self.size(),
                    b.len()
                ),
            });
        };

        let value = match self {
            Self::Float32 => f64::from(f32::from_be_bytes(word32(b))),
            Self::Float32Swapped => f64::from(f32::from_be_bytes(swapped32(b))),
            Self::Uint16 => f64::from(u16::from_be_bytes([b[0], b[1]])),
            Self::Uint32 => f64::from(u32::from_be_bytes(word32(b))),
            Self::Uint32Swapped => f64::from(u32::from_be_bytes(swapped32(b))),
            Self::Uint64 => u64::from_be_bytes(word64(b)) as f64,
            Self::Int16 => f64::from(i16::from_be_bytes([b[0], b[1]])),
            Self::Int32 => f64::from(i32::from_be_bytes(word32(b))),
            Self::Int32Swapped => f64::from(i32::from_be_bytes(swapped32(b))),
            Self::Int64 => i64::from_be_bytes(word64(b)) as f64,
        };
        Ok(value)
    }
}

const fn word32(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

const fn swapped32(b: &[u8]) -> [u8; 4] {
    [b[2], b[3], b[0], b[1]]
}

const fn word64(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Decoding plus optional scaling and "not available" detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    encoding: Encoding,
    scaler: Option<f64>,
    nan_aware: bool,
}

impl Transform {
    /// Plain decoding.
    #[must_use]
    pub const fn new(encoding: Encoding) -> Self {
        Self {
            encoding,
            scaler: None,
            nan_aware: false,
        }
    }

    /// Divides the decoded value by `scaler`.
    #[must_use]
    pub const fn scaled(mut self, scaler: f64) -> Self {
        self.scaler = Some(scaler);
        self
    }

    /// Maps the all-ones pattern (`0x7fff..` for signed encodings) to NaN.
    #[must_use]
    pub const fn nan_aware(mut self) -> Self {
        self.nan_aware = true;
        self
    }

    /// Returns the underlying encoding.
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Decodes and scales `b`.
    ///
    /// # Errors
    ///
    /// Returns a device error if `b` is too short.
    pub fn apply(&self, b: &[u8]) -> Result<f64> {
        let value = self.encoding.decode(b)?;

        if self.nan_aware && self.is_not_available(b) {
            return Ok(f64::NAN);
        }

        Ok(match self.scaler {
            Some(scaler) => value / scaler,
            None => value,
        })
    }

    fn is_not_available(&self, b: &[u8]) -> bool {
        let (first, rest) = b[..self.encoding.size()].split_at(1);
        let lead = if self.encoding.is_signed() { 0x7f } else { 0xff };
        first[0] == lead && rest.iter().all(|&byte| byte == 0xff)
    }
}
