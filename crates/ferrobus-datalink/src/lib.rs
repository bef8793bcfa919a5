//! Async Modbus transport layer.
//!
//! A [`Transport`] performs one request/response exchange of PDUs; the TCP
//! implementation speaks MBAP framing, the serial implementation (behind
//! the `rtu` feature) speaks CRC-delimited RTU frames. The server side
//! lives in [`server`], backed by the [`ByteRing`] byte FIFO.

#![forbid(unsafe_code)]

pub mod ring;
#[cfg(feature = "rtu")]
pub mod rtu;
pub mod server;
pub mod sim;
pub mod tcp;

pub use ring::ByteRing;
#[cfg(feature = "rtu")]
pub use rtu::{RtuTransport, SerialSettings};
pub use server::{HandlerVerdict, RequestHandler, ServerHandle, TcpServer};
pub use sim::InMemoryDevice;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use ferrobus_core::{DecodeError, EncodeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("frame error: {0}")]
    Frame(#[from] DecodeError),
    #[error("crc mismatch in response frame")]
    CrcMismatch,
    #[error("connection closed before the response completed")]
    ConnectionClosed,
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
}

#[async_trait]
pub trait Transport: Send {
    /// Send one request PDU to a unit and receive exactly one response PDU.
    ///
    /// Returns the number of bytes written into `response_pdu`. The caller
    /// serializes access; implementations need no internal locking.
    async fn exchange(
        &mut self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, TransportError>;
}
