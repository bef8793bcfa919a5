use crate::encoding::{Reader, Writer};
use crate::pdu::{
    FunctionCode, ReadDeviceIdRequest, MAX_BIT_READ, MAX_BIT_WRITE, MAX_REGISTER_READ,
    MAX_REGISTER_WRITE, MEI_READ_DEVICE_ID,
};
use crate::{DecodeError, EncodeError};

fn validate_quantity(quantity: u16, max: u16) -> Result<(), EncodeError> {
    if quantity == 0 || quantity > max {
        return Err(EncodeError::ValueOutOfRange);
    }
    Ok(())
}

fn validate_quantity_decode(quantity: u16, max: u16) -> Result<(), DecodeError> {
    if quantity == 0 || quantity > max {
        return Err(DecodeError::InvalidValue);
    }
    Ok(())
}

/// Pack bit values into bytes, LSB of each byte holding the lowest address.
pub fn pack_bits(values: &[bool], out: &mut [u8]) {
    out.fill(0);
    for (i, value) in values.iter().enumerate() {
        if *value {
            out[i / 8] |= 1u8 << (i % 8);
        }
    }
}

/// A read of `quantity` objects starting at `start_address`, for any of the
/// four read function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub function: FunctionCode,
    pub start_address: u16,
    pub quantity: u16,
}

impl ReadRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if !self.function.is_read() {
            return Err(EncodeError::ValueOutOfRange);
        }
        let max = if self.function.is_bit_read() {
            MAX_BIT_READ
        } else {
            MAX_REGISTER_READ
        };
        validate_quantity(self.quantity, max)?;
        w.write_u8(self.function.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(self.quantity)?;
        Ok(())
    }
}

/// A single-object write carrying the raw wire value (coils use
/// 0xFF00/0x0000).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteSingleRequest {
    pub function: FunctionCode,
    pub address: u16,
    pub value: u16,
}

impl WriteSingleRequest {
    pub fn coil(address: u16, value: bool) -> Self {
        Self {
            function: FunctionCode::WriteSingleCoil,
            address,
            value: if value { 0xFF00 } else { 0x0000 },
        }
    }

    pub fn register(address: u16, value: u16) -> Self {
        Self {
            function: FunctionCode::WriteSingleRegister,
            address,
            value,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self.function {
            FunctionCode::WriteSingleCoil => {
                if self.value != 0xFF00 && self.value != 0x0000 {
                    return Err(EncodeError::ValueOutOfRange);
                }
            }
            FunctionCode::WriteSingleRegister => {}
            _ => return Err(EncodeError::ValueOutOfRange),
        }
        w.write_u8(self.function.as_u8())?;
        w.write_be_u16(self.address)?;
        w.write_be_u16(self.value)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleCoilsRequest<'a> {
    pub start_address: u16,
    pub values: &'a [bool],
}

impl WriteMultipleCoilsRequest<'_> {
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        let quantity: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        validate_quantity(quantity, MAX_BIT_WRITE)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = self.quantity()?;
        let byte_count = self.values.len().div_ceil(8);

        w.write_u8(FunctionCode::WriteMultipleCoils.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(quantity)?;
        w.write_u8(byte_count as u8)?;

        let mut packed = [0u8; 246];
        pack_bits(self.values, &mut packed[..byte_count]);
        w.write_all(&packed[..byte_count])?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMultipleRegistersRequest<'a> {
    pub start_address: u16,
    pub values: &'a [u16],
}

impl WriteMultipleRegistersRequest<'_> {
    pub fn quantity(&self) -> Result<u16, EncodeError> {
        let quantity: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| EncodeError::ValueOutOfRange)?;
        validate_quantity(quantity, MAX_REGISTER_WRITE)?;
        Ok(quantity)
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let quantity = self.quantity()?;
        w.write_u8(FunctionCode::WriteMultipleRegisters.as_u8())?;
        w.write_be_u16(self.start_address)?;
        w.write_be_u16(quantity)?;
        w.write_u8((self.values.len() * 2) as u8)?;
        for value in self.values {
            w.write_be_u16(*value)?;
        }
        Ok(())
    }
}

/// Every request PDU this engine can build, as one tagged variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Read(ReadRequest),
    WriteSingle(WriteSingleRequest),
    WriteMultipleCoils(WriteMultipleCoilsRequest<'a>),
    WriteMultipleRegisters(WriteMultipleRegistersRequest<'a>),
    ReadDeviceId(ReadDeviceIdRequest),
}

impl Request<'_> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(req) => req.function,
            Self::WriteSingle(req) => req.function,
            Self::WriteMultipleCoils(_) => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters(_) => FunctionCode::WriteMultipleRegisters,
            Self::ReadDeviceId(_) => FunctionCode::ReadDeviceIdentification,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::Read(req) => req.encode(w),
            Self::WriteSingle(req) => req.encode(w),
            Self::WriteMultipleCoils(req) => req.encode(w),
            Self::WriteMultipleRegisters(req) => req.encode(w),
            Self::ReadDeviceId(req) => req.encode(w),
        }
    }
}

/// An inbound request PDU decoded for server-side dispatch.
///
/// Multi-write payloads stay in their wire form: packed bits for coils,
/// big-endian words for registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedRequest<'a> {
    Read(ReadRequest),
    WriteSingle(WriteSingleRequest),
    WriteMultipleCoils {
        start_address: u16,
        quantity: u16,
        data: &'a [u8],
    },
    WriteMultipleRegisters {
        start_address: u16,
        data: &'a [u8],
    },
    ReadDeviceId(ReadDeviceIdRequest),
}

impl<'a> DecodedRequest<'a> {
    pub fn function_code(&self) -> FunctionCode {
        match self {
            Self::Read(request) => request.function,
            Self::WriteSingle(request) => request.function,
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils,
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
            Self::ReadDeviceId(_) => FunctionCode::ReadDeviceIdentification,
        }
    }

    pub fn decode(r: &mut Reader<'a>) -> Result<Self, DecodeError> {
        let function = FunctionCode::from_u8(r.read_u8()?)?;
        match function {
            FunctionCode::ReadCoils
            | FunctionCode::ReadDiscreteInputs
            | FunctionCode::ReadHoldingRegisters
            | FunctionCode::ReadInputRegisters => {
                let start_address = r.read_be_u16()?;
                let quantity = r.read_be_u16()?;
                let max = if function.is_bit_read() {
                    MAX_BIT_READ
                } else {
                    MAX_REGISTER_READ
                };
                validate_quantity_decode(quantity, max)?;
                Ok(Self::Read(ReadRequest {
                    function,
                    start_address,
                    quantity,
                }))
            }
            FunctionCode::WriteSingleCoil => {
                let address = r.read_be_u16()?;
                let value = r.read_be_u16()?;
                if value != 0xFF00 && value != 0x0000 {
                    return Err(DecodeError::InvalidValue);
                }
                Ok(Self::WriteSingle(WriteSingleRequest {
                    function,
                    address,
                    value,
                }))
            }
            FunctionCode::WriteSingleRegister => Ok(Self::WriteSingle(WriteSingleRequest {
                function,
                address: r.read_be_u16()?,
                value: r.read_be_u16()?,
            })),
            FunctionCode::WriteMultipleCoils => {
                let start_address = r.read_be_u16()?;
                let quantity = r.read_be_u16()?;
                validate_quantity_decode(quantity, MAX_BIT_WRITE)?;
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != usize::from(quantity).div_ceil(8) {
                    return Err(DecodeError::InvalidLength);
                }
                Ok(Self::WriteMultipleCoils {
                    start_address,
                    quantity,
                    data: r.read_exact(byte_count)?,
                })
            }
            FunctionCode::WriteMultipleRegisters => {
                let start_address = r.read_be_u16()?;
                let quantity = r.read_be_u16()?;
                validate_quantity_decode(quantity, MAX_REGISTER_WRITE)?;
                let byte_count = usize::from(r.read_u8()?);
                if byte_count != usize::from(quantity) * 2 {
                    return Err(DecodeError::InvalidLength);
                }
                Ok(Self::WriteMultipleRegisters {
                    start_address,
                    data: r.read_exact(byte_count)?,
                })
            }
            FunctionCode::ReadDeviceIdentification => {
                if r.read_u8()? != MEI_READ_DEVICE_ID {
                    return Err(DecodeError::InvalidValue);
                }
                Ok(Self::ReadDeviceId(ReadDeviceIdRequest {
                    category: r.read_u8()?,
                    first_object_id: r.read_u8()?,
                }))
            }
        }
    }
}
