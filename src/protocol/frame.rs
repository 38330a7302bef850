//! Splitting a response byte stream into Modbus RTU, ASCII and TCP frames.
//!
//! ```text
//! RTU    ┌───────┬───────────┬──────────────┐
//!        │ slave │    PDU    │ CRC-16 (LE)  │
//!        └───────┴───────────┴──────────────┘
//! ASCII  ':' hex(slave PDU LRC) CR LF
//! TCP    ┌──────────┬──────────┬──────────┬──────┬───────┐
//!        │ txn (BE) │ 0x0000   │ len (BE) │ unit │  PDU  │
//!        └──────────┴──────────┴──────────┴──────┴───────┘
//! ```
//!
//! The decoder only finds frame boundaries. Checksums and the match against
//! the request are verified by [`ReadRequest::parse`](super::ReadRequest::parse).

use bytes::{Buf, Bytes, BytesMut};
use rmodbus::{ModbusProto, guess_response_frame_len};
use serde::Deserialize;

use super::pdu::{EXCEPTION_FLAG, MAX_READ_REGISTERS};
use crate::error::FrameError;

/// Maximum RTU frame size.
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Maximum MBAP length field (unit id plus 253 byte PDU).
pub const MAX_MBAP_LENGTH: usize = 254;

/// MBAP header size including the unit id.
pub const MBAP_HEADER_SIZE: usize = 7;

/// Maximum ASCII frame size between start and end markers.
pub const MAX_ASCII_FRAME_SIZE: usize = 513;

/// ASCII start-of-frame marker.
pub(crate) const ASCII_START: u8 = b':';

/// ASCII end-of-frame marker.
pub(crate) const ASCII_END: &[u8] = b"\r\n";

/// Wire framing of a Modbus link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framing {
    /// Binary frames protected by CRC-16.
    Rtu,
    /// Hex text frames protected by LRC.
    Ascii,
    /// MBAP header, no checksum.
    Tcp,
}

impl From<Framing> for ModbusProto {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Rtu => Self::Rtu,
            Framing::Ascii => Self::Ascii,
            Framing::Tcp => Self::TcpUdp,
        }
    }
}

/// One complete response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Slave address or unit id.
    pub slave: u8,
    /// Transaction id (TCP only, zero otherwise).
    pub transaction: u16,
    /// Binary frame including header and checksum. ASCII frames are
    /// hex-decoded, without markers.
    pub frame: Bytes,
}

/// Incremental response decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a decoder for the given framing.
    #[must_use]
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buffer: BytesMut::new(),
        }
    }

    /// Returns the framing this decoder expects.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to split off the next complete response frame.
    ///
    /// Returns `Ok(None)` while more data is needed.
    ///
    /// # Errors
    ///
    /// Returns a `FrameError` on malformed ASCII, an oversize frame, an
    /// unknown function code or a foreign MBAP protocol id. The offending
    /// bytes are discarded.
    pub fn decode(&mut self) -> Result<Option<Adu>, FrameError> {
        let result = match self.framing {
            Framing::Rtu => self.decode_rtu(),
            Framing::Ascii => self.decode_ascii(),
            Framing::Tcp => self.decode_tcp(),
        };
        if result.is_err() {
            self.buffer.clear();
        }
        result
    }

    fn decode_rtu(&mut self) -> Result<Option<Adu>, FrameError> {
        if self.buffer.len() < 3 {
            return Ok(None);
        }

        let function = self.buffer[1];
        let count = usize::from(self.buffer[2]);
        if function & EXCEPTION_FLAG == 0 && count > 2 * usize::from(MAX_READ_REGISTERS) {
            return Err(FrameError::TooLarge {
                size: count + 5,
                max: MAX_RTU_FRAME_SIZE,
            });
        }

        let total = guess_response_frame_len(&self.buffer, ModbusProto::Rtu)
            .map_err(|_| FrameError::UnknownFunction(function))?;
        let total = usize::from(total);
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        Ok(Some(Adu {
            slave: frame[0],
            transaction: 0,
            frame,
        }))
    }

    fn decode_ascii(&mut self) -> Result<Option<Adu>, FrameError> {
        // Noise before the start marker is dropped
        match self.buffer.iter().position(|&b| b == ASCII_START) {
            Some(start) => self.buffer.advance(start),
            None => {
                self.buffer.clear();
                return Ok(None);
            }
        }

        let Some(end) = self
            .buffer
            .windows(ASCII_END.len())
            .position(|w| w == ASCII_END)
        else {
            if self.buffer.len() > MAX_ASCII_FRAME_SIZE {
                return Err(FrameError::TooLarge {
                    size: self.buffer.len(),
                    max: MAX_ASCII_FRAME_SIZE,
                });
            }
            return Ok(None);
        };

        let text = self.buffer.split_to(end + ASCII_END.len());
        let raw = hex::decode(&text[1..end]).map_err(|e| FrameError::InvalidAscii {
            reason: e.to_string(),
        })?;
        if raw.len() < 3 {
            return Err(FrameError::TooShort {
                min: 3,
                got: raw.len(),
            });
        }

        Ok(Some(Adu {
            slave: raw[0],
            transaction: 0,
            frame: Bytes::from(raw),
        }))
    }

    fn decode_tcp(&mut self) -> Result<Option<Adu>, FrameError> {
        if self.buffer.len() < MBAP_HEADER_SIZE {
            return Ok(None);
        }

        let protocol = u16::from_be_bytes([self.buffer[2], self.buffer[3]]);
        if protocol != 0 {
            return Err(FrameError::InvalidProtocolId(protocol));
        }

        let length = usize::from(u16::from_be_bytes([self.buffer[4], self.buffer[5]]));
        if length < 2 {
            return Err(FrameError::TooShort {
                min: 2,
                got: length,
            });
        }
        if length > MAX_MBAP_LENGTH {
            return Err(FrameError::TooLarge {
                size: length,
                max: MAX_MBAP_LENGTH,
            });
        }

        let total = MBAP_HEADER_SIZE - 1 + length;
        if self.buffer.len() < total {
            return Ok(None);
        }

        let frame = self.buffer.split_to(total).freeze();
        Ok(Some(Adu {
            slave: frame[6],
            transaction: u16::from_be_bytes([frame[0], frame[1]]),
            frame,
        }))
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
