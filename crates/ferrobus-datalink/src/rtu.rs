use crate::{Transport, TransportError};
use async_trait::async_trait;
use ferrobus_core::encoding::Writer;
use ferrobus_core::frame::rtu as rtu_frame;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};
use tracing::trace;

/// Unit id, the largest PDU, the CRC, and slack for device id payloads.
const RESPONSE_BUFFER_LEN: usize = 272;

/// Serial line settings. The Modbus serial spec fixes eight data bits and
/// derives the stop bits from parity: one stop bit with parity, two
/// without. `stop_bits: None` applies that rule; `Some` overrides it.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: Option<StopBits>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 19_200,
            parity: Parity::Even,
            stop_bits: None,
        }
    }
}

impl SerialSettings {
    fn effective_stop_bits(&self) -> StopBits {
        self.stop_bits.unwrap_or(match self.parity {
            Parity::None => StopBits::Two,
            _ => StopBits::One,
        })
    }
}

/// A Modbus RTU serial connection performing one exchange at a time.
#[derive(Debug)]
pub struct RtuTransport {
    stream: SerialStream,
}

impl RtuTransport {
    pub fn open(path: &str, settings: SerialSettings) -> Result<Self, TransportError> {
        let builder = tokio_serial::new(path, settings.baud_rate)
            .parity(settings.parity)
            .data_bits(DataBits::Eight)
            .stop_bits(settings.effective_stop_bits())
            .flow_control(FlowControl::None);
        let stream = builder.open_native_async().map_err(|err| {
            TransportError::Io(std::io::Error::other(format!(
                "failed to open serial port '{path}': {err}"
            )))
        })?;
        Ok(Self { stream })
    }

    pub fn from_stream(stream: SerialStream) -> Self {
        Self { stream }
    }
}

async fn read_exact_or_closed<S>(stream: &mut S, buf: &mut [u8]) -> Result<(), TransportError>
where
    S: AsyncRead + Unpin,
{
    if let Err(err) = stream.read_exact(buf).await {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(TransportError::ConnectionClosed);
        }
        return Err(TransportError::Io(err));
    }
    Ok(())
}

/// Read exactly one RTU response frame into `buf` and return the length of
/// its body (unit id and PDU, without the CRC).
///
/// RTU has no length prefix, so the total length is inferred from the
/// function code: read responses declare a byte count, write echoes are
/// fixed-size, device identification walks its object list, and an
/// exception is always three bytes. The trailing CRC is verified before
/// anything is returned.
async fn read_response_frame<S>(stream: &mut S, buf: &mut [u8]) -> Result<usize, TransportError>
where
    S: AsyncRead + Unpin,
{
    read_exact_or_closed(stream, &mut buf[..2]).await?;
    let function = buf[1];

    let body_len = if function & 0x80 != 0 {
        read_exact_or_closed(stream, &mut buf[2..3]).await?;
        3
    } else {
        match function {
            0x01..=0x04 => {
                read_exact_or_closed(stream, &mut buf[2..3]).await?;
                let data_len = usize::from(buf[2]);
                read_exact_or_closed(stream, &mut buf[3..3 + data_len]).await?;
                3 + data_len
            }
            0x05 | 0x06 | 0x0F | 0x10 => {
                read_exact_or_closed(stream, &mut buf[2..6]).await?;
                6
            }
            0x2B => {
                read_exact_or_closed(stream, &mut buf[2..8]).await?;
                let object_count = usize::from(buf[7]);
                let mut total = 8;
                for _ in 0..object_count {
                    if total + 4 > buf.len() {
                        return Err(TransportError::InvalidFrame(
                            "device identification frame too long",
                        ));
                    }
                    read_exact_or_closed(stream, &mut buf[total..total + 2]).await?;
                    let value_len = usize::from(buf[total + 1]);
                    if total + 2 + value_len + 2 > buf.len() {
                        return Err(TransportError::InvalidFrame(
                            "device identification frame too long",
                        ));
                    }
                    read_exact_or_closed(stream, &mut buf[total + 2..total + 2 + value_len])
                        .await?;
                    total += 2 + value_len;
                }
                total
            }
            _ => {
                return Err(TransportError::InvalidFrame(
                    "unexpected function code in response",
                ))
            }
        }
    };

    read_exact_or_closed(stream, &mut buf[body_len..body_len + 2]).await?;
    if rtu_frame::crc16(&buf[..body_len + 2]) != 0 {
        return Err(TransportError::CrcMismatch);
    }
    Ok(body_len)
}

#[async_trait]
impl Transport for RtuTransport {
    async fn exchange(
        &mut self,
        unit_id: u8,
        request_pdu: &[u8],
        response_pdu: &mut [u8],
    ) -> Result<usize, TransportError> {
        if request_pdu.is_empty() {
            return Err(TransportError::InvalidFrame("empty request pdu"));
        }

        // Push out anything still queued, then drop stale input left over
        // from a broken prior exchange so it cannot be taken for this
        // response.
        self.stream.flush().await?;
        self.stream
            .clear(ClearBuffer::Input)
            .map_err(|err| TransportError::Io(std::io::Error::other(err)))?;

        let mut frame = [0u8; 256];
        let mut w = Writer::new(&mut frame);
        rtu_frame::encode_frame(&mut w, unit_id, request_pdu)?;
        trace!(unit_id, pdu_len = request_pdu.len(), "sending modbus rtu request");
        self.stream.write_all(w.as_written()).await?;
        self.stream.flush().await?;

        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        let body_len = read_response_frame(&mut self.stream, &mut buf).await?;
        let body = &buf[..body_len];
        if body[0] != unit_id {
            return Err(TransportError::InvalidFrame("response from unexpected unit"));
        }

        let pdu = &body[1..];
        if pdu.is_empty() {
            return Err(TransportError::InvalidFrame("empty response pdu"));
        }
        if pdu.len() > response_pdu.len() {
            return Err(TransportError::InvalidFrame("response buffer too small"));
        }
        response_pdu[..pdu.len()].copy_from_slice(pdu);
        trace!(unit_id, pdu_len = pdu.len(), "received modbus rtu response");
        Ok(pdu.len())
    }
}
