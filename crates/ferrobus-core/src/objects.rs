//! The typed object model: kinds, values and the sparse collection.

use crate::pdu::{
    FunctionCode, MAX_BIT_READ, MAX_BIT_WRITE, MAX_REGISTER_READ, MAX_REGISTER_WRITE,
};
use crate::range::{self, Range};
use std::collections::BTreeMap;
use thiserror::Error;

/// The four Modbus object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl ObjectKind {
    /// Whether objects of this kind are single bits rather than words.
    pub const fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }

    pub const fn is_writable(self) -> bool {
        matches!(self, Self::Coil | Self::HoldingRegister)
    }

    pub const fn read_function(self) -> FunctionCode {
        match self {
            Self::Coil => FunctionCode::ReadCoils,
            Self::DiscreteInput => FunctionCode::ReadDiscreteInputs,
            Self::HoldingRegister => FunctionCode::ReadHoldingRegisters,
            Self::InputRegister => FunctionCode::ReadInputRegisters,
        }
    }

    /// Most objects of this kind a single read may request.
    pub const fn max_read_length(self) -> u16 {
        if self.is_bit() {
            MAX_BIT_READ
        } else {
            MAX_REGISTER_READ
        }
    }

    /// Most objects of this kind a single write may carry.
    pub const fn max_write_length(self) -> u16 {
        if self.is_bit() {
            MAX_BIT_WRITE
        } else {
            MAX_REGISTER_WRITE
        }
    }
}

/// The payload of one object, shaped by its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectValue {
    Bit(bool),
    Word(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectError {
    #[error("no {kind:?} object at address {address}")]
    Missing { kind: ObjectKind, address: u16 },
    #[error("operation not supported for {kind:?} objects")]
    WrongKind { kind: ObjectKind },
    #[error("object addresses overflow the 16-bit space")]
    AddressOverflow,
    #[error("character does not fit a single-byte encoding")]
    NotSingleByte,
    #[error("stored words are not valid utf-16")]
    InvalidUtf16,
}

/// A sparse, single-kind map from object address to value.
///
/// Bit objects are stored as 0/1 words so one representation serves both
/// shapes; the typed accessors enforce the kind. Multi-word setters lay the
/// value out most-significant-word first and replace whatever was stored at
/// the overlapped addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCollection {
    kind: ObjectKind,
    entries: BTreeMap<u16, u16>,
}

impl ObjectCollection {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, address: u16) -> bool {
        self.entries.contains_key(&address)
    }

    /// Addresses in ascending order.
    pub fn addresses(&self) -> impl Iterator<Item = u16> + '_ {
        self.entries.keys().copied()
    }

    /// `(address, raw word)` pairs in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.entries.iter().map(|(addr, word)| (*addr, *word))
    }

    pub fn value(&self, address: u16) -> Option<ObjectValue> {
        let word = *self.entries.get(&address)?;
        Some(if self.kind.is_bit() {
            ObjectValue::Bit(word != 0)
        } else {
            ObjectValue::Word(word)
        })
    }

    fn lookup(&self, address: u16) -> Result<u16, ObjectError> {
        self.entries.get(&address).copied().ok_or(ObjectError::Missing {
            kind: self.kind,
            address,
        })
    }

    fn require_registers(&self) -> Result<(), ObjectError> {
        if self.kind.is_bit() {
            return Err(ObjectError::WrongKind { kind: self.kind });
        }
        Ok(())
    }

    /// Store the raw word backing one object; bits are normalized to 0/1.
    pub fn set_word(&mut self, address: u16, word: u16) {
        let word = if self.kind.is_bit() { u16::from(word != 0) } else { word };
        self.entries.insert(address, word);
    }

    /// The raw word backing one object.
    pub fn word(&self, address: u16) -> Result<u16, ObjectError> {
        self.lookup(address)
    }

    pub fn set_bit(&mut self, address: u16, value: bool) -> Result<(), ObjectError> {
        if !self.kind.is_bit() {
            return Err(ObjectError::WrongKind { kind: self.kind });
        }
        self.entries.insert(address, u16::from(value));
        Ok(())
    }

    pub fn bit(&self, address: u16) -> Result<bool, ObjectError> {
        if !self.kind.is_bit() {
            return Err(ObjectError::WrongKind { kind: self.kind });
        }
        Ok(self.lookup(address)? != 0)
    }

    fn set_words(&mut self, address: u16, words: &[u16]) -> Result<(), ObjectError> {
        self.require_registers()?;
        if words.is_empty() {
            return Ok(());
        }
        let last = u32::from(address) + words.len() as u32 - 1;
        if last > u32::from(u16::MAX) {
            return Err(ObjectError::AddressOverflow);
        }
        for (offset, word) in words.iter().enumerate() {
            self.entries.insert(address + offset as u16, *word);
        }
        Ok(())
    }

    fn words(&self, address: u16, count: u16) -> Result<Vec<u16>, ObjectError> {
        self.require_registers()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let last = u32::from(address) + u32::from(count) - 1;
        if last > u32::from(u16::MAX) {
            return Err(ObjectError::AddressOverflow);
        }
        (0..count).map(|offset| self.lookup(address + offset)).collect()
    }

    pub fn set_u16(&mut self, address: u16, value: u16) -> Result<(), ObjectError> {
        self.set_words(address, &[value])
    }

    pub fn u16(&self, address: u16) -> Result<u16, ObjectError> {
        self.require_registers()?;
        self.lookup(address)
    }

    pub fn set_i16(&mut self, address: u16, value: i16) -> Result<(), ObjectError> {
        self.set_u16(address, value as u16)
    }

    pub fn i16(&self, address: u16) -> Result<i16, ObjectError> {
        Ok(self.u16(address)? as i16)
    }

    pub fn set_u32(&mut self, address: u16, value: u32) -> Result<(), ObjectError> {
        self.set_words(address, &[(value >> 16) as u16, value as u16])
    }

    pub fn u32(&self, address: u16) -> Result<u32, ObjectError> {
        let words = self.words(address, 2)?;
        Ok(u32::from(words[0]) << 16 | u32::from(words[1]))
    }

    pub fn set_i32(&mut self, address: u16, value: i32) -> Result<(), ObjectError> {
        self.set_u32(address, value as u32)
    }

    pub fn i32(&self, address: u16) -> Result<i32, ObjectError> {
        Ok(self.u32(address)? as i32)
    }

    pub fn set_u64(&mut self, address: u16, value: u64) -> Result<(), ObjectError> {
        self.set_words(
            address,
            &[
                (value >> 48) as u16,
                (value >> 32) as u16,
                (value >> 16) as u16,
                value as u16,
            ],
        )
    }

    pub fn u64(&self, address: u16) -> Result<u64, ObjectError> {
        let words = self.words(address, 4)?;
        Ok(u64::from(words[0]) << 48
            | u64::from(words[1]) << 32
            | u64::from(words[2]) << 16
            | u64::from(words[3]))
    }

    pub fn set_i64(&mut self, address: u16, value: i64) -> Result<(), ObjectError> {
        self.set_u64(address, value as u64)
    }

    pub fn i64(&self, address: u16) -> Result<i64, ObjectError> {
        Ok(self.u64(address)? as i64)
    }

    pub fn set_f32(&mut self, address: u16, value: f32) -> Result<(), ObjectError> {
        self.set_u32(address, value.to_bits())
    }

    pub fn f32(&self, address: u16) -> Result<f32, ObjectError> {
        Ok(f32::from_bits(self.u32(address)?))
    }

    pub fn set_f64(&mut self, address: u16, value: f64) -> Result<(), ObjectError> {
        self.set_u64(address, value.to_bits())
    }

    pub fn f64(&self, address: u16) -> Result<f64, ObjectError> {
        Ok(f64::from_bits(self.u64(address)?))
    }

    /// Store a string two single-byte characters per word, high byte first.
    /// Characters above U+00FF are rejected; an odd-length string pads the
    /// final low byte with zero.
    pub fn set_str8(&mut self, address: u16, value: &str) -> Result<(), ObjectError> {
        let mut bytes = Vec::with_capacity(value.len());
        for ch in value.chars() {
            let code = u32::from(ch);
            if code > 0xFF {
                return Err(ObjectError::NotSingleByte);
            }
            bytes.push(code as u8);
        }
        let words: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from(pair[0]) << 8 | u16::from(pair.get(1).copied().unwrap_or(0)))
            .collect();
        self.set_words(address, &words)
    }

    /// Read `char_count` single-byte characters packed from `address` on.
    pub fn str8(&self, address: u16, char_count: u16) -> Result<String, ObjectError> {
        let words = self.words(address, char_count.div_ceil(2))?;
        let mut out = String::with_capacity(usize::from(char_count));
        for (i, word) in words.iter().enumerate() {
            out.push(char::from((word >> 8) as u8));
            if 2 * i as u16 + 1 < char_count {
                out.push(char::from(*word as u8));
            }
        }
        Ok(out)
    }

    /// Store a string one UTF-16 code unit per word.
    pub fn set_str16(&mut self, address: u16, value: &str) -> Result<(), ObjectError> {
        let words: Vec<u16> = value.encode_utf16().collect();
        self.set_words(address, &words)
    }

    /// Read `word_count` UTF-16 code units from `address` on.
    pub fn str16(&self, address: u16, word_count: u16) -> Result<String, ObjectError> {
        let words = self.words(address, word_count)?;
        String::from_utf16(&words).map_err(|_| ObjectError::InvalidUtf16)
    }

    /// Project the stored addresses into planned request ranges.
    pub fn ranges(&self, max_length: u16, allowed_waste: u16) -> Vec<Range> {
        let units: Vec<Range> = self.addresses().map(Range::single).collect();
        range::plan(&units, max_length, allowed_waste)
    }
}
