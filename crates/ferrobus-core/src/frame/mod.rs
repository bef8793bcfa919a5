//! Transport framing: MBAP for TCP, CRC-16 for RTU.

pub mod rtu;
pub mod tcp;
