use crate::encoding::Writer;
use crate::{DecodeError, EncodeError};

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const CRC16_TABLE: [u16; 256] = build_crc16_table();

/// Continue a CRC-16 computation over `data`.
pub fn crc16_update(mut crc: u16, data: &[u8]) -> u16 {
    for byte in data {
        let idx = ((crc ^ u16::from(*byte)) & 0x00FF) as usize;
        crc = (crc >> 8) ^ CRC16_TABLE[idx];
    }
    crc
}

/// Modbus CRC-16: polynomial 0xA001 (reflected), initial value 0xFFFF.
///
/// A frame followed by its own little-endian CRC hashes to zero, so
/// `crc16(frame) == 0` verifies a received frame in one pass.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_update(0xFFFF, data)
}

/// Encode a complete RTU frame: unit id, PDU, CRC little-endian.
pub fn encode_frame(w: &mut Writer<'_>, unit_id: u8, pdu: &[u8]) -> Result<(), EncodeError> {
    if pdu.is_empty() || pdu.len() > 253 {
        return Err(EncodeError::InvalidLength);
    }
    w.write_u8(unit_id)?;
    w.write_all(pdu)?;
    let crc = crc16_update(crc16_update(0xFFFF, &[unit_id]), pdu);
    w.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Verify the trailing CRC of `frame` and split it into unit id and PDU.
pub fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8]), DecodeError> {
    if frame.len() < 4 {
        return Err(DecodeError::InvalidLength);
    }
    if crc16(frame) != 0 {
        return Err(DecodeError::CrcMismatch);
    }
    let body = &frame[..frame.len() - 2];
    Ok((body[0], &body[1..]))
}

#[cfg(test)]
mod tests {
    use super::{crc16, decode_frame, encode_frame};
    use crate::encoding::Writer;
    use crate::DecodeError;

    #[test]
    fn crc16_known_vectors() {
        assert_eq!(crc16(&[]), 0xFFFF);
        // fc03 read of two registers at address 0, CRC C4 0B on the wire.
        assert_eq!(
            crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]).to_le_bytes(),
            [0xC4, 0x0B]
        );
        assert_eq!(
            crc16(&[0x01, 0x03, 0x04, 0x00, 0x01, 0x00, 0x02]).to_le_bytes(),
            [0x2A, 0x32]
        );
    }

    #[test]
    fn frame_roundtrip() {
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        encode_frame(&mut w, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();
        assert_eq!(
            w.as_written(),
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]
        );

        let (unit_id, pdu) = decode_frame(w.as_written()).unwrap();
        assert_eq!(unit_id, 0x01);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x02]);
    }

    #[test]
    fn tampered_frame_is_detected() {
        let mut frame = [0u8; 16];
        let mut w = Writer::new(&mut frame);
        encode_frame(&mut w, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]).unwrap();

        let mut tampered = w.as_written().to_vec();
        tampered[3] ^= 0x40;
        assert_eq!(decode_frame(&tampered).unwrap_err(), DecodeError::CrcMismatch);
    }
}
