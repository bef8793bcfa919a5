//! Modbus protocol encoding, framing and the typed object model.
//!
//! `ferrobus-core` contains everything that can be expressed without I/O:
//! PDU builders and decoders for both supported transports, the CRC-16 and
//! MBAP framing primitives, the address-range planner that turns arbitrary
//! address sets into protocol-legal requests, and the typed object
//! collection the client API speaks in.

#![forbid(unsafe_code)]

pub mod codec;
pub mod encoding;
pub mod error;
pub mod frame;
pub mod objects;
pub mod pdu;
pub mod range;

pub use error::{CodecError, DecodeError, EncodeError};
pub use objects::{ObjectCollection, ObjectError, ObjectKind, ObjectValue};
pub use pdu::ExceptionCode;
pub use range::Range;
