use crate::{Transport, TransportError};
use async_trait::async_trait;
use ferrobus_core::encoding::Writer;
use ferrobus_core::frame::tcp::{self, MbapPrefix, MAX_FRAME_BODY, MBAP_PREFIX_LEN};
use std::sync::atomic::{AtomicU16, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{trace, warn};

/// Prefix plus the largest legal frame body, with slack for devices that
/// pad their frames.
const RESPONSE_BUFFER_LEN: usize = 272;

/// A Modbus TCP connection performing one MBAP exchange at a time.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    next_transaction_id: AtomicU16,
}

impl TcpTransport {
    /// Connect to `addr`. Every resolved address is attempted in turn, so
    /// v4 and v6 endpoints both work.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        Ok(Self::from_stream(TcpStream::connect(addr).await?))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            next_transaction_id: AtomicU16::new(1),
        }
    }

    /// Monotonic 16-bit transaction counter, wrapping at 0x10000.
    fn next_tid(&self) -> u16 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn exchange(
        &mut self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, TransportError> {
        if request_pdu.is_empty() {
            return Err(TransportError::InvalidFrame("empty request pdu"));
        }

        let transaction_id = self.next_tid();
        let mut frame = [0u8; MBAP_PREFIX_LEN + MAX_FRAME_BODY];
        let mut w = Writer::new(&mut frame);
        tcp::encode_frame(&mut w, transaction_id, unit_id, request_pdu)?;

        trace!(
            transaction_id,
            unit_id,
            pdu_len = request_pdu.len(),
            "sending modbus tcp request"
        );
        self.stream.write_all(w.as_written()).await?;

        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        let mut used = 0usize;
        while used < MBAP_PREFIX_LEN {
            let n = self.stream.read(&mut buf[used..]).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            used += n;
        }

        let mut prefix_bytes = [0u8; MBAP_PREFIX_LEN];
        prefix_bytes.copy_from_slice(&buf[..MBAP_PREFIX_LEN]);
        let prefix = MbapPrefix::from_bytes(&prefix_bytes)?;
        let total = MBAP_PREFIX_LEN + usize::from(prefix.length);

        while used < total {
            let n = self.stream.read(&mut buf[used..]).await?;
            if n == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            used += n;
        }

        if prefix.transaction_id != transaction_id {
            // Noncompliant servers echo stale ids; accept the frame anyway.
            warn!(
                expected = transaction_id,
                got = prefix.transaction_id,
                "transaction id mismatch in response"
            );
        }

        let body = &buf[MBAP_PREFIX_LEN..total];
        let pdu = &body[1..];
        if pdu.is_empty() {
            return Err(TransportError::InvalidFrame("empty response pdu"));
        }
        if pdu.len() > response_pdu.len() {
            return Err(TransportError::InvalidFrame("response buffer too small"));
        }
        response_pdu[..pdu.len()].copy_from_slice(pdu);
        trace!(transaction_id, unit_id, pdu_len = pdu.len(), "received modbus tcp response");
        Ok(pdu.len())
    }
}
