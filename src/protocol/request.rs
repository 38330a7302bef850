//! Register read requests.
//!
//! Request bytes and response checks (CRC, LRC, MBAP header, unit id and
//! function) come from [`rmodbus`]. This module adds the ASCII text
//! envelope and extracts the register payload.

use bytes::Bytes;
use rmodbus::client::ModbusRequest;
use rmodbus::{ErrorKind, ModbusProto};

use super::frame::{ASCII_END, ASCII_START, Framing};
use super::pdu::{EXCEPTION_FLAG, ExceptionCode, FunctionCode};
use crate::error::{Error, Result};

/// One outstanding read.
pub struct ReadRequest {
    request: ModbusRequest,
    framing: Framing,
    function: FunctionCode,
    quantity: u16,
    wire: Bytes,
}

impl ReadRequest {
    /// Builds the request and its wire encoding.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Modbus`] when the request cannot be encoded.
    pub fn new(
        framing: Framing,
        slave: u8,
        transaction: u16,
        function: FunctionCode,
        address: u16,
        quantity: u16,
    ) -> Result<Self> {
        let mut request = ModbusRequest::new(slave, ModbusProto::from(framing));
        request.tr_id = transaction;

        let mut raw = Vec::new();
        match function {
            FunctionCode::ReadHoldingRegisters => {
                request.generate_get_holdings(address, quantity, &mut raw)?;
            }
            FunctionCode::ReadInputRegisters => {
                request.generate_get_inputs(address, quantity, &mut raw)?;
            }
        }

        let wire = match framing {
            Framing::Ascii => {
                let mut text = Vec::with_capacity(raw.len() * 2 + 3);
                text.push(ASCII_START);
                text.extend_from_slice(hex::encode_upper(&raw).as_bytes());
                text.extend_from_slice(ASCII_END);
                Bytes::from(text)
            }
            Framing::Rtu | Framing::Tcp => Bytes::from(raw),
        };

        Ok(Self {
            request,
            framing,
            function,
            quantity,
            wire,
        })
    }

    /// Returns the bytes to put on the link.
    #[must_use]
    pub fn wire(&self) -> &[u8] {
        &self.wire
    }

    /// Checks a binary response frame and returns the register bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exception`] for exception responses,
    /// [`Error::Modbus`] when the frame fails its checksum or does not
    /// answer this request, and a protocol error for a wrong byte count.
    pub fn parse(&self, frame: &[u8]) -> Result<Bytes> {
        let (header, trailer) = match self.framing {
            Framing::Rtu => (1, 2),
            Framing::Ascii => (1, 1),
            Framing::Tcp => (7, 0),
        };

        if let Err(kind) = self.request.parse_ok(frame) {
            let function = frame.get(header).copied().unwrap_or_default();
            if !matches!(kind, ErrorKind::FrameCRCError)
                && function == self.function.as_byte() | EXCEPTION_FLAG
            {
                return Err(Error::Exception {
                    function: self.function.as_byte(),
                    code: ExceptionCode::from_byte(
                        frame.get(header + 1).copied().unwrap_or_default(),
                    ),
                });
            }
            return Err(kind.into());
        }

        if frame.get(header) != Some(&self.function.as_byte()) {
            return Err(Error::protocol(format!(
                "unexpected function in response, expected {:#04x}",
                self.function.as_byte()
            )));
        }

        let expected = usize::from(self.quantity) * 2;
        let count = frame.get(header + 1).map(|&c| usize::from(c));
        let start = header + 2;
        if count != Some(expected) || frame.len() != start + expected + trailer {
            return Err(Error::protocol(format!(
                "unexpected byte count {count:?} ({} bytes), expected {expected}",
                frame.len().saturating_sub(start + trailer)
            )));
        }

        Ok(Bytes::copy_from_slice(&frame[start..start + expected]))
    }
}
