use crate::encoding::{Reader, Writer};
use crate::pdu::{ExceptionCode, ExceptionResponse, FunctionCode};
use crate::{CodecError, DecodeError, EncodeError};

/// MEI type for Read Device Identification under function code 0x2B.
pub const MEI_READ_DEVICE_ID: u8 = 0x0E;

/// Read Device Identification categories (the "read device id code").
pub mod category {
    pub const BASIC: u8 = 1;
    pub const REGULAR: u8 = 2;
    pub const EXTENDED: u8 = 3;
}

/// Well-known device identification object ids.
pub mod object_id {
    pub const VENDOR_NAME: u8 = 0x00;
    pub const PRODUCT_CODE: u8 = 0x01;
    pub const MAJOR_MINOR_REVISION: u8 = 0x02;
    pub const VENDOR_URL: u8 = 0x03;
    pub const PRODUCT_NAME: u8 = 0x04;
    pub const MODEL_NAME: u8 = 0x05;
    pub const USER_APPLICATION_NAME: u8 = 0x06;
    pub const FIRST_PRIVATE_OBJECT: u8 = 0x80;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadDeviceIdRequest {
    pub category: u8,
    pub first_object_id: u8,
}

impl ReadDeviceIdRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8(FunctionCode::ReadDeviceIdentification.as_u8())?;
        w.write_u8(MEI_READ_DEVICE_ID)?;
        w.write_u8(self.category)?;
        w.write_u8(self.first_object_id)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub object_id: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadDeviceIdResponse {
    pub category: u8,
    pub conformity_level: u8,
    pub more_follows: bool,
    pub next_object_id: u8,
    pub objects: Vec<DeviceIdObject>,
}

impl ReadDeviceIdResponse {
    /// Decode a device identification response PDU.
    ///
    /// The decoder is deliberately tolerant of two deviations seen in field
    /// gateways: the declared object count is ignored (objects are consumed
    /// until the body ends), and a bare `[0x2B, 0x0E, code]` reply is taken
    /// as the exception `code` even though the exception bit is missing.
    ///
    /// `last_requested_object` is the object id the request started at; a
    /// continuation pointer that does not advance past it is reported as
    /// `DeviceIdentificationLoop`.
    pub fn decode(
        r: &mut Reader<'_>,
        last_requested_object: u8,
    ) -> Result<Self, CodecError> {
        let function_byte = r.read_u8().map_err(CodecError::Decode)?;
        if FunctionCode::is_exception(function_byte) {
            let ex = ExceptionResponse::decode(function_byte, r)?;
            return Err(CodecError::Exception(ex.exception_code));
        }
        if function_byte != FunctionCode::ReadDeviceIdentification.as_u8() {
            return Err(DecodeError::InvalidFunctionCode.into());
        }

        let mei = r.read_u8()?;
        if mei != MEI_READ_DEVICE_ID {
            return Err(DecodeError::InvalidValue.into());
        }

        // Truncated body: the MEI echo is outside 1..8, so a single trailing
        // byte inside that range is an exception code a nonconforming
        // gateway forgot to flag.
        if r.remaining() == 1 {
            let code = r.read_u8()?;
            if (1..=8).contains(&code) {
                return Err(CodecError::Exception(ExceptionCode::from_u8(code)));
            }
            return Err(CodecError::IncompleteResponse);
        }

        let category = r.read_u8()?;
        let conformity_level = r.read_u8()?;
        let more_follows = r.read_u8()? != 0;
        let next_object_id = r.read_u8()?;
        let _declared_count = r.read_u8()?;

        let mut objects = Vec::new();
        while !r.is_empty() {
            let object_id = r.read_u8()?;
            let len = usize::from(r.read_u8().map_err(|_| CodecError::IncompleteResponse)?);
            let value = r
                .read_exact(len)
                .map_err(|_| CodecError::IncompleteResponse)?;
            objects.push(DeviceIdObject {
                object_id,
                value: value.to_vec(),
            });
        }

        if more_follows && next_object_id <= last_requested_object {
            return Err(CodecError::DeviceIdentificationLoop);
        }

        Ok(Self {
            category,
            conformity_level,
            more_follows,
            next_object_id,
            objects,
        })
    }
}
