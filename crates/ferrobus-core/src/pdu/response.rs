use crate::encoding::{Reader, Writer};
use crate::pdu::{ExceptionResponse, FunctionCode, MAX_BIT_READ, MAX_REGISTER_READ};
use crate::{DecodeError, EncodeError};

/// Bit `index` of a packed bit payload, LSB of each byte first.
pub fn coil_bit(data: &[u8], index: usize) -> Option<bool> {
    let byte = data.get(index / 8)?;
    Some((byte & (1u8 << (index % 8))) != 0)
}

/// Big-endian 16-bit word `index` of a register payload.
pub fn register_word(data: &[u8], index: usize) -> Option<u16> {
    let offset = index.checked_mul(2)?;
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Every response PDU this engine can interpret, as one tagged variant.
///
/// Write echoes are kept raw; judging them against what was sent is the
/// codec layer's job, because a bad echo is a write failure rather than a
/// malformed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    ReadBits {
        function: FunctionCode,
        data: &'a [u8],
    },
    ReadWords {
        function: FunctionCode,
        data: &'a [u8],
    },
    WriteSingle {
        function: FunctionCode,
        address: u16,
        value: u16,
    },
    WriteMultiple {
        function: FunctionCode,
        start_address: u16,
        quantity: u16,
    },
    Exception(ExceptionResponse),
}

impl<'a> Response<'a> {
    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function_byte = r.read_u8()?;
        if FunctionCode::is_exception(function_byte) {
            return Ok(Self::Exception(ExceptionResponse::decode(function_byte, r)?));
        }

        let function = FunctionCode::from_u8(function_byte)?;
        match function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                let byte_count = usize::from(r.read_u8()?);
                if byte_count == 0 || byte_count > usize::from(MAX_BIT_READ).div_ceil(8) {
                    return Err(DecodeError::InvalidLength);
                }
                let data = r.read_exact(byte_count)?;
                Ok(Self::ReadBits { function, data })
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                let byte_count = usize::from(r.read_u8()?);
                if byte_count == 0
                    || byte_count % 2 != 0
                    || byte_count > usize::from(MAX_REGISTER_READ) * 2
                {
                    return Err(DecodeError::InvalidLength);
                }
                let data = r.read_exact(byte_count)?;
                Ok(Self::ReadWords { function, data })
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                Ok(Self::WriteSingle {
                    function,
                    address: r.read_be_u16()?,
                    value: r.read_be_u16()?,
                })
            }
            FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
                Ok(Self::WriteMultiple {
                    function,
                    start_address: r.read_be_u16()?,
                    quantity: r.read_be_u16()?,
                })
            }
            // Device identification has its own decoder with the gateway
            // tolerances; it never passes through here.
            FunctionCode::ReadDeviceIdentification => Err(DecodeError::InvalidFunctionCode),
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ReadBits { function, data } | Self::ReadWords { function, data } => {
                let byte_count: u8 = data
                    .len()
                    .try_into()
                    .map_err(|_| EncodeError::ValueOutOfRange)?;
                w.write_u8(function.as_u8())?;
                w.write_u8(byte_count)?;
                w.write_all(data)?;
                Ok(())
            }
            Self::WriteSingle {
                function,
                address,
                value,
            } => {
                w.write_u8(function.as_u8())?;
                w.write_be_u16(*address)?;
                w.write_be_u16(*value)?;
                Ok(())
            }
            Self::WriteMultiple {
                function,
                start_address,
                quantity,
            } => {
                w.write_u8(function.as_u8())?;
                w.write_be_u16(*start_address)?;
                w.write_be_u16(*quantity)?;
                Ok(())
            }
            Self::Exception(resp) => resp.encode(w),
        }
    }
}
