//! Modbus PDU builders and decoders.

mod device_id;
mod exception;
mod function_code;
mod request;
mod response;

pub use device_id::{
    category, object_id, DeviceIdObject, ReadDeviceIdRequest, ReadDeviceIdResponse,
    MEI_READ_DEVICE_ID,
};
pub use exception::{ExceptionCode, ExceptionResponse};
pub use function_code::FunctionCode;
pub use request::{
    pack_bits, DecodedRequest, ReadRequest, Request, WriteMultipleCoilsRequest,
    WriteMultipleRegistersRequest, WriteSingleRequest,
};
pub use response::{coil_bit, register_word, Response};

/// Most bit objects a single read request may cover.
pub const MAX_BIT_READ: u16 = 2008;

/// Most register objects a single request may cover.
pub const MAX_REGISTER_READ: u16 = 123;

/// Most coils a single multi-write may cover; bounded by the 254-byte PDU.
pub const MAX_BIT_WRITE: u16 = 1968;

/// Most registers a single multi-write may cover.
pub const MAX_REGISTER_WRITE: u16 = 123;
