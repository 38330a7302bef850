//! Modbus wire protocol: function codes, framing and read requests.

pub mod frame;
pub mod pdu;
pub mod request;

pub use frame::{Adu, FrameDecoder, Framing};
pub use pdu::{ExceptionCode, FunctionCode, MAX_READ_REGISTERS};
pub use request::ReadRequest;
