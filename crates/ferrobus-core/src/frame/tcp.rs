use crate::encoding::{Reader, Writer};
use crate::{DecodeError, EncodeError};

/// Bytes in the MBAP prefix: transaction id, protocol id, length.
pub const MBAP_PREFIX_LEN: usize = 6;

/// Upper bound of the MBAP length field: unit id plus a 253-byte PDU.
pub const MAX_FRAME_BODY: usize = 254;

/// The MBAP prefix preceding every Modbus TCP frame body.
///
/// The protocol id is always zero on the wire and therefore implicit; the
/// length field counts the frame body, i.e. the unit id byte plus the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapPrefix {
    pub transaction_id: u16,
    pub length: u16,
}

impl MbapPrefix {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_be_u16(self.transaction_id)?;
        w.write_be_u16(0)?;
        w.write_be_u16(self.length)?;
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let transaction_id = r.read_be_u16()?;
        let protocol_id = r.read_be_u16()?;
        let length = r.read_be_u16()?;

        if protocol_id != 0 {
            return Err(DecodeError::InvalidValue);
        }
        if length == 0 || usize::from(length) > MAX_FRAME_BODY {
            return Err(DecodeError::InvalidLength);
        }

        Ok(Self {
            transaction_id,
            length,
        })
    }

    pub fn from_bytes(bytes: &[u8; MBAP_PREFIX_LEN]) -> Result<Self, DecodeError> {
        Self::decode(&mut Reader::new(bytes))
    }
}

/// Encode a complete frame: prefix, unit id, PDU.
pub fn encode_frame(
    w: &mut Writer<'_>,
    transaction_id: u16,
    unit_id: u8,
    pdu: &[u8],
) -> Result<(), EncodeError> {
    if pdu.is_empty() || pdu.len() + 1 > MAX_FRAME_BODY {
        return Err(EncodeError::InvalidLength);
    }
    let prefix = MbapPrefix {
        transaction_id,
        length: pdu.len() as u16 + 1,
    };
    prefix.encode(w)?;
    w.write_u8(unit_id)?;
    w.write_all(pdu)?;
    Ok(())
}

/// Decode a complete frame into its prefix, unit id and PDU slice.
pub fn decode_frame<'a>(r: &mut Reader<'a>) -> Result<(MbapPrefix, u8, &'a [u8]), DecodeError> {
    let prefix = MbapPrefix::decode(r)?;
    let body = r.read_exact(usize::from(prefix.length))?;
    Ok((prefix, body[0], &body[1..]))
}
