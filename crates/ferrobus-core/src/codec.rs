//! Translation between PDUs and typed object collections.
//!
//! The builders turn a planned range or a slice of stored words into a
//! request PDU; the decoders validate a response against what was asked and
//! either fill a collection, confirm a write, or surface the failure. Write
//! echoes are judged here: a wrong address is `AddressMismatch`, a wrong
//! value or an unconfirmed count is `WriteMismatch`.

use crate::encoding::{Reader, Writer};
use crate::objects::{ObjectCollection, ObjectKind};
use crate::pdu::{
    coil_bit, register_word, FunctionCode, ReadDeviceIdRequest, ReadDeviceIdResponse, ReadRequest,
    Request, Response, WriteMultipleCoilsRequest, WriteMultipleRegistersRequest,
    WriteSingleRequest,
};
use crate::range::Range;
use crate::{CodecError, DecodeError, EncodeError};

fn write_single_function(kind: ObjectKind) -> Option<FunctionCode> {
    match kind {
        ObjectKind::Coil => Some(FunctionCode::WriteSingleCoil),
        ObjectKind::HoldingRegister => Some(FunctionCode::WriteSingleRegister),
        _ => None,
    }
}

fn write_multiple_function(kind: ObjectKind) -> Option<FunctionCode> {
    match kind {
        ObjectKind::Coil => Some(FunctionCode::WriteMultipleCoils),
        ObjectKind::HoldingRegister => Some(FunctionCode::WriteMultipleRegisters),
        _ => None,
    }
}

/// Build a read request for one planned range.
pub fn build_read_request(
    kind: ObjectKind,
    range: Range,
    w: &mut Writer<'_>,
) -> Result<(), EncodeError> {
    let quantity = u16::try_from(range.len()).map_err(|_| EncodeError::ValueOutOfRange)?;
    Request::Read(ReadRequest {
        function: kind.read_function(),
        start_address: range.start(),
        quantity,
    })
    .encode(w)
}

/// Decode a read response into `out`, returning how many objects the device
/// actually delivered. A short response is not an error; the caller
/// re-requests the remainder.
pub fn decode_read_response(
    range: Range,
    pdu: &[u8],
    out: &mut ObjectCollection,
) -> Result<u16, CodecError> {
    let kind = out.kind();
    let mut r = Reader::new(pdu);
    match Response::decode(&mut r)? {
        Response::Exception(ex) => Err(CodecError::Exception(ex.exception_code)),
        Response::ReadBits { function, data }
            if kind.is_bit() && function == kind.read_function() =>
        {
            let available = (data.len() * 8) as u32;
            let delivered = range.len().min(available) as u16;
            for i in 0..delivered {
                if let Some(bit) = coil_bit(data, usize::from(i)) {
                    out.set_word(range.start() + i, u16::from(bit));
                }
            }
            Ok(delivered)
        }
        Response::ReadWords { function, data }
            if !kind.is_bit() && function == kind.read_function() =>
        {
            let available = (data.len() / 2) as u32;
            let delivered = range.len().min(available) as u16;
            for i in 0..delivered {
                if let Some(word) = register_word(data, usize::from(i)) {
                    out.set_word(range.start() + i, word);
                }
            }
            Ok(delivered)
        }
        _ => Err(DecodeError::InvalidFunctionCode.into()),
    }
}

/// Build a single-object write; `word` is the stored representation
/// (0/1 for coils).
pub fn build_write_single(
    kind: ObjectKind,
    address: u16,
    word: u16,
    w: &mut Writer<'_>,
) -> Result<(), EncodeError> {
    let request = match kind {
        ObjectKind::Coil => WriteSingleRequest::coil(address, word != 0),
        ObjectKind::HoldingRegister => WriteSingleRequest::register(address, word),
        _ => return Err(EncodeError::ValueOutOfRange),
    };
    Request::WriteSingle(request).encode(w)
}

/// Validate the echo of a single-object write.
pub fn decode_write_single_response(
    kind: ObjectKind,
    address: u16,
    word: u16,
    pdu: &[u8],
) -> Result<(), CodecError> {
    let expected_function = write_single_function(kind).ok_or(DecodeError::InvalidFunctionCode)?;
    let sent = match kind {
        ObjectKind::Coil => {
            if word != 0 {
                0xFF00
            } else {
                0x0000
            }
        }
        _ => word,
    };

    let mut r = Reader::new(pdu);
    match Response::decode(&mut r)? {
        Response::Exception(ex) => Err(CodecError::Exception(ex.exception_code)),
        Response::WriteSingle {
            function,
            address: echoed_address,
            value,
        } if function == expected_function => {
            if echoed_address != address {
                return Err(CodecError::AddressMismatch {
                    expected: address,
                    actual: echoed_address,
                });
            }
            if value != sent {
                return Err(CodecError::WriteMismatch);
            }
            Ok(())
        }
        _ => Err(DecodeError::InvalidFunctionCode.into()),
    }
}

/// Build a multi-object write; `values` are the stored words of the range
/// in address order (0/1 for coils).
pub fn build_write_multiple(
    kind: ObjectKind,
    start_address: u16,
    values: &[u16],
    w: &mut Writer<'_>,
) -> Result<(), EncodeError> {
    match kind {
        ObjectKind::Coil => {
            let bits: Vec<bool> = values.iter().map(|word| *word != 0).collect();
            Request::WriteMultipleCoils(WriteMultipleCoilsRequest {
                start_address,
                values: &bits,
            })
            .encode(w)
        }
        ObjectKind::HoldingRegister => Request::WriteMultipleRegisters(
            WriteMultipleRegistersRequest {
                start_address,
                values,
            },
        )
        .encode(w),
        _ => Err(EncodeError::ValueOutOfRange),
    }
}

/// Validate a multi-object write confirmation and return the confirmed
/// count. Zero is `WriteMismatch`; a partial count is returned so the
/// caller can re-send the remainder (a tolerated device deviation).
pub fn decode_write_multiple_response(
    kind: ObjectKind,
    start_address: u16,
    requested: u16,
    pdu: &[u8],
) -> Result<u16, CodecError> {
    let expected_function =
        write_multiple_function(kind).ok_or(DecodeError::InvalidFunctionCode)?;

    let mut r = Reader::new(pdu);
    match Response::decode(&mut r)? {
        Response::Exception(ex) => Err(CodecError::Exception(ex.exception_code)),
        Response::WriteMultiple {
            function,
            start_address: echoed_start,
            quantity,
        } if function == expected_function => {
            if echoed_start != start_address {
                return Err(CodecError::AddressMismatch {
                    expected: start_address,
                    actual: echoed_start,
                });
            }
            if quantity == 0 {
                return Err(CodecError::WriteMismatch);
            }
            Ok(quantity.min(requested))
        }
        _ => Err(DecodeError::InvalidFunctionCode.into()),
    }
}

/// Build a Read Device Identification request.
pub fn build_read_device_id(
    category: u8,
    first_object_id: u8,
    w: &mut Writer<'_>,
) -> Result<(), EncodeError> {
    Request::ReadDeviceId(ReadDeviceIdRequest {
        category,
        first_object_id,
    })
    .encode(w)
}

/// Decode a Read Device Identification response with the gateway
/// tolerances described on [`ReadDeviceIdResponse::decode`].
pub fn decode_read_device_id(
    pdu: &[u8],
    last_requested_object: u8,
) -> Result<ReadDeviceIdResponse, CodecError> {
    let mut r = Reader::new(pdu);
    ReadDeviceIdResponse::decode(&mut r, last_requested_object)
}
