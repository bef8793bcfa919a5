//! A read-only in-memory device for tests and demos.
//!
//! [`InMemoryDevice`] serves the four read function codes from object
//! collections populated ahead of time. Frames addressed to other units are
//! ignored, writes are answered with `IllegalFunction` (this engine's
//! server side does not support writes), and addresses that were never
//! populated earn `IllegalDataAddress`.

use crate::server::{HandlerVerdict, RequestHandler};
use ferrobus_core::encoding::{Reader, Writer};
use ferrobus_core::objects::{ObjectCollection, ObjectKind};
use ferrobus_core::pdu::{
    pack_bits, DecodedRequest, ExceptionCode, ExceptionResponse, FunctionCode, ReadRequest,
    Response,
};

pub struct InMemoryDevice {
    unit_id: u8,
    coils: ObjectCollection,
    discrete_inputs: ObjectCollection,
    holding_registers: ObjectCollection,
    input_registers: ObjectCollection,
}

impl InMemoryDevice {
    pub fn new(unit_id: u8) -> Self {
        Self {
            unit_id,
            coils: ObjectCollection::new(ObjectKind::Coil),
            discrete_inputs: ObjectCollection::new(ObjectKind::DiscreteInput),
            holding_registers: ObjectCollection::new(ObjectKind::HoldingRegister),
            input_registers: ObjectCollection::new(ObjectKind::InputRegister),
        }
    }

    pub fn coils_mut(&mut self) -> &mut ObjectCollection {
        &mut self.coils
    }

    pub fn discrete_inputs_mut(&mut self) -> &mut ObjectCollection {
        &mut self.discrete_inputs
    }

    pub fn holding_registers_mut(&mut self) -> &mut ObjectCollection {
        &mut self.holding_registers
    }

    pub fn input_registers_mut(&mut self) -> &mut ObjectCollection {
        &mut self.input_registers
    }

    fn exception(
        &self,
        function_code: u8,
        exception_code: ExceptionCode,
        response: &mut [u8],
    ) -> HandlerVerdict {
        let written = {
            let mut w = Writer::new(&mut response[1..]);
            Response::Exception(ExceptionResponse {
                function_code,
                exception_code,
            })
            .encode(&mut w)
            .map(|()| w.as_written().len())
        };
        match written {
            Ok(len) => HandlerVerdict::Reply(1 + len),
            Err(_) => HandlerVerdict::Close,
        }
    }

    fn serve_read(&self, request: ReadRequest, response: &mut [u8]) -> HandlerVerdict {
        let function = request.function.as_u8();
        let bank = match request.function {
            FunctionCode::ReadCoils => &self.coils,
            FunctionCode::ReadDiscreteInputs => &self.discrete_inputs,
            FunctionCode::ReadHoldingRegisters => &self.holding_registers,
            FunctionCode::ReadInputRegisters => &self.input_registers,
            _ => return self.exception(function, ExceptionCode::IllegalFunction, response),
        };

        let mut words = Vec::with_capacity(usize::from(request.quantity));
        for offset in 0..request.quantity {
            let Some(address) = request.start_address.checked_add(offset) else {
                return self.exception(function, ExceptionCode::IllegalDataAddress, response);
            };
            match bank.word(address) {
                Ok(word) => words.push(word),
                Err(_) => {
                    return self.exception(function, ExceptionCode::IllegalDataAddress, response)
                }
            }
        }

        let written = {
            let mut w = Writer::new(&mut response[1..]);
            let encoded = if request.function.is_bit_read() {
                let bits: Vec<bool> = words.iter().map(|word| *word != 0).collect();
                let byte_count = bits.len().div_ceil(8);
                let mut packed = [0u8; 251];
                pack_bits(&bits, &mut packed[..byte_count]);
                Response::ReadBits {
                    function: request.function,
                    data: &packed[..byte_count],
                }
                .encode(&mut w)
            } else {
                let mut data = Vec::with_capacity(words.len() * 2);
                for word in &words {
                    data.extend_from_slice(&word.to_be_bytes());
                }
                Response::ReadWords {
                    function: request.function,
                    data: &data,
                }
                .encode(&mut w)
            };
            encoded.map(|()| w.as_written().len())
        };
        match written {
            Ok(len) => HandlerVerdict::Reply(1 + len),
            Err(_) => self.exception(function, ExceptionCode::ServerDeviceFailure, response),
        }
    }
}

impl RequestHandler for InMemoryDevice {
    fn handle(&self, body: &[u8], response: &mut [u8]) -> HandlerVerdict {
        let Some((&unit_id, pdu)) = body.split_first() else {
            return HandlerVerdict::Close;
        };
        if unit_id != self.unit_id {
            return HandlerVerdict::NoReply;
        }
        response[0] = unit_id;

        let mut r = Reader::new(pdu);
        let decoded = match DecodedRequest::decode(&mut r) {
            Ok(request) if r.is_empty() => request,
            _ => {
                let function = pdu.first().copied().unwrap_or(0) & 0x7F;
                return self.exception(function, ExceptionCode::IllegalDataValue, response);
            }
        };

        match decoded {
            DecodedRequest::Read(request) => self.serve_read(request, response),
            other => self.exception(
                other.function_code().as_u8(),
                ExceptionCode::IllegalFunction,
                response,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InMemoryDevice;
    use crate::server::{HandlerVerdict, RequestHandler};

    fn device() -> InMemoryDevice {
        let mut device = InMemoryDevice::new(1);
        device.holding_registers_mut().set_u16(0, 0x2A).unwrap();
        device.holding_registers_mut().set_u16(1, 0x2B).unwrap();
        device.coils_mut().set_bit(0, true).unwrap();
        device.coils_mut().set_bit(1, false).unwrap();
        device.coils_mut().set_bit(2, true).unwrap();
        device
    }

    #[test]
    fn serves_register_reads() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02], &mut response);
        assert_eq!(verdict, HandlerVerdict::Reply(7));
        assert_eq!(&response[..7], &[0x01, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x2B]);
    }

    #[test]
    fn serves_coil_reads_packed() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x03], &mut response);
        assert_eq!(verdict, HandlerVerdict::Reply(4));
        assert_eq!(&response[..4], &[0x01, 0x01, 0x01, 0b101]);
    }

    #[test]
    fn frames_for_other_units_are_ignored() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x07, 0x03, 0x00, 0x00, 0x00, 0x01], &mut response);
        assert_eq!(verdict, HandlerVerdict::NoReply);
    }

    #[test]
    fn missing_addresses_earn_an_exception() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x01, 0x03, 0x00, 0x05, 0x00, 0x01], &mut response);
        assert_eq!(verdict, HandlerVerdict::Reply(3));
        assert_eq!(&response[..3], &[0x01, 0x83, 0x02]);
    }

    #[test]
    fn writes_are_rejected() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x01, 0x06, 0x00, 0x00, 0x00, 0x63], &mut response);
        assert_eq!(verdict, HandlerVerdict::Reply(3));
        assert_eq!(&response[..3], &[0x01, 0x86, 0x01]);
    }

    #[test]
    fn malformed_requests_earn_an_exception() {
        let mut response = [0u8; 254];
        let verdict = device().handle(&[0x01, 0x03, 0x00, 0x00], &mut response);
        assert_eq!(verdict, HandlerVerdict::Reply(3));
        assert_eq!(&response[..3], &[0x01, 0x83, 0x03]);
    }
}
