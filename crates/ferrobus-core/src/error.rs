use crate::pdu::ExceptionCode;
use thiserror::Error;

/// Errors raised while encoding Modbus data into an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("value out of range")]
    ValueOutOfRange,
    #[error("invalid length")]
    InvalidLength,
}

/// Errors raised while decoding Modbus data from an input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid function code")]
    InvalidFunctionCode,
    #[error("invalid length")]
    InvalidLength,
    #[error("invalid value")]
    InvalidValue,
    #[error("crc mismatch")]
    CrcMismatch,
}

/// Errors raised while translating a response PDU into typed objects.
///
/// These carry the protocol-integrity failures that end a transaction
/// without retry, plus the negative response a device can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("device exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("response echoes address {actual}, expected {expected}")]
    AddressMismatch { expected: u16, actual: u16 },
    #[error("device did not confirm the written values")]
    WriteMismatch,
    #[error("response ended before the declared payload")]
    IncompleteResponse,
    #[error("device identification object stream does not advance")]
    DeviceIdentificationLoop,
}

impl CodecError {
    /// Numeric code for interop logging: exception codes keep their wire
    /// values 1..8, internal kinds are numbered from 256 up.
    pub fn code(&self) -> u16 {
        match self {
            Self::Exception(code) => u16::from(code.as_u8()),
            Self::Decode(DecodeError::CrcMismatch) => 256,
            Self::DeviceIdentificationLoop => 257,
            Self::IncompleteResponse | Self::Decode(_) => 258,
            Self::AddressMismatch { .. } => 259,
            Self::WriteMismatch => 260,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CodecError, DecodeError};
    use crate::pdu::ExceptionCode;

    #[test]
    fn exception_codes_keep_wire_values() {
        assert_eq!(CodecError::Exception(ExceptionCode::IllegalFunction).code(), 1);
        assert_eq!(CodecError::Exception(ExceptionCode::MemoryParityError).code(), 8);
    }

    #[test]
    fn internal_kinds_start_at_256() {
        assert_eq!(CodecError::Decode(DecodeError::CrcMismatch).code(), 256);
        assert_eq!(CodecError::WriteMismatch.code(), 260);
        assert!(CodecError::AddressMismatch { expected: 1, actual: 2 }.code() >= 256);
    }
}
