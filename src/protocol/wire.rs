//! Tagged field encoding
//!
//! Each field is a varint key `(field_number << 3) | wire_type` followed by
//! its value. This is the protobuf binary layout; only the subset needed by
//! the event schema is typed, everything else is carried through opaquely.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{FieldKind, MessageDescriptor};

/// Largest legal field number (2^29 - 1)
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Maximum encoded length of a 64-bit varint
const MAX_VARINT_LEN: usize = 10;

/// Maximum depth of embedded messages
pub const MAX_NESTING_DEPTH: usize = 64;

/// Reasons a payload is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated value at offset {offset}")]
    Truncated { offset: usize },

    #[error("Varint wider than 64 bits at offset {offset}")]
    VarintOverflow { offset: usize },

    #[error("Length {declared} at offset {offset} overruns payload ({available} bytes left)")]
    LengthOverrun {
        offset: usize,
        declared: u64,
        available: usize,
    },

    #[error("Invalid field number {number} at offset {offset}")]
    InvalidFieldNumber { number: u64, offset: usize },

    #[error("Unsupported wire type {wire_type} at offset {offset}")]
    UnsupportedWireType { wire_type: u8, offset: usize },

    #[error("Field {field} expects {expected} but was encoded as {actual}")]
    WireTypeMismatch {
        field: u32,
        expected: WireType,
        actual: WireType,
    },

    #[error("Field {field} is not valid UTF-8")]
    InvalidUtf8 { field: u32 },

    #[error("Messages nested deeper than {max} levels")]
    NestingTooDeep { max: usize },
}

pub type WireResult<T> = Result<T, WireError>;

/// 3-bit wire type carried in every field key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

impl WireType {
    /// Group start/end (3, 4) and reserved types (6, 7) are not accepted
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(WireType::Varint),
            1 => Some(WireType::Fixed64),
            2 => Some(WireType::LengthDelimited),
            5 => Some(WireType::Fixed32),
            _ => None,
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WireType::Varint => "varint",
            WireType::Fixed64 => "fixed64",
            WireType::LengthDelimited => "length-delimited",
            WireType::Fixed32 => "fixed32",
        };
        f.write_str(name)
    }
}

/// A single decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    UInt(u64),
    SInt(i64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    Message(Message),
    /// Field not present in the descriptor. `raw` holds the value bytes as
    /// they appeared on the wire, without the key (and without the length
    /// prefix for length-delimited values).
    Unknown { wire_type: WireType, raw: Bytes },
}

impl WireValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            WireValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::SInt(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            WireValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            WireValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            WireValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            WireValue::Message(m) => Some(m),
            _ => None,
        }
    }
}

/// A decoded message: field number → values in arrival order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    fields: BTreeMap<u32, Vec<WireValue>>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Message::push`]
    pub fn with(mut self, number: u32, value: WireValue) -> Self {
        self.push(number, value);
        self
    }

    /// Append a value; repeated fields keep insertion order
    pub fn push(&mut self, number: u32, value: WireValue) {
        self.fields.entry(number).or_default().push(value);
    }

    /// Replace all values of a field
    pub fn set(&mut self, number: u32, value: WireValue) {
        self.fields.insert(number, vec![value]);
    }

    pub fn remove(&mut self, number: u32) -> Vec<WireValue> {
        self.fields.remove(&number).unwrap_or_default()
    }

    /// Last value of a field, which wins for singular fields
    pub fn get(&self, number: u32) -> Option<&WireValue> {
        self.fields.get(&number).and_then(|values| values.last())
    }

    pub fn get_all(&self, number: u32) -> &[WireValue] {
        self.fields.get(&number).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, number: u32) -> bool {
        self.fields.contains_key(&number)
    }

    pub fn get_u64(&self, number: u32) -> Option<u64> {
        self.get(number).and_then(WireValue::as_u64)
    }

    pub fn get_i64(&self, number: u32) -> Option<i64> {
        self.get(number).and_then(WireValue::as_i64)
    }

    pub fn get_bool(&self, number: u32) -> Option<bool> {
        self.get(number).and_then(WireValue::as_bool)
    }

    pub fn get_str(&self, number: u32) -> Option<&str> {
        self.get(number).and_then(WireValue::as_str)
    }

    pub fn get_message(&self, number: u32) -> Option<&Message> {
        self.get(number).and_then(WireValue::as_message)
    }

    /// Populated field numbers, ascending
    pub fn field_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.fields.keys().copied()
    }

    /// All (field number, value) pairs, ascending by field
    pub fn iter(&self) -> impl Iterator<Item = (u32, &WireValue)> {
        self.fields
            .iter()
            .flat_map(|(number, values)| values.iter().map(move |v| (*number, v)))
    }

    /// Number of distinct populated fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Decode a payload against a descriptor
pub fn decode_message(payload: &Bytes, descriptor: &MessageDescriptor) -> WireResult<Message> {
    decode_nested(payload, 0, descriptor, 0)
}

fn decode_nested(data: &Bytes, base: usize, descriptor: &MessageDescriptor, depth: usize) -> WireResult<Message> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::NestingTooDeep { max: MAX_NESTING_DEPTH });
    }

    let mut message = Message::new();
    let mut pos = 0;

    while pos < data.len() {
        let key_offset = base + pos;
        let key = read_varint(data, &mut pos, base)?;

        let number = key >> 3;
        if number == 0 || number > u64::from(MAX_FIELD_NUMBER) {
            return Err(WireError::InvalidFieldNumber {
                number,
                offset: key_offset,
            });
        }
        let number = number as u32;

        let raw_type = (key & 0x07) as u8;
        let wire_type = WireType::from_raw(raw_type).ok_or(WireError::UnsupportedWireType {
            wire_type: raw_type,
            offset: key_offset,
        })?;

        let Some(field) = descriptor.get(number) else {
            let raw = read_raw(data, &mut pos, base, wire_type)?;
            message.push(number, WireValue::Unknown { wire_type, raw });
            continue;
        };

        let expected = field.kind.wire_type();
        if expected != wire_type {
            return Err(WireError::WireTypeMismatch {
                field: number,
                expected,
                actual: wire_type,
            });
        }

        let value = match &field.kind {
            FieldKind::UInt => WireValue::UInt(read_varint(data, &mut pos, base)?),
            FieldKind::SInt => WireValue::SInt(zigzag_decode(read_varint(data, &mut pos, base)?)),
            FieldKind::Bool => WireValue::Bool(read_varint(data, &mut pos, base)? != 0),
            FieldKind::String => {
                let bytes = read_length_delimited(data, &mut pos, base)?;
                let text = std::str::from_utf8(&bytes).map_err(|_| WireError::InvalidUtf8 { field: number })?;
                WireValue::String(text.to_owned())
            }
            FieldKind::Bytes => WireValue::Bytes(read_length_delimited(data, &mut pos, base)?),
            FieldKind::Message(nested) => {
                let bytes = read_length_delimited(data, &mut pos, base)?;
                let content_base = base + pos - bytes.len();
                WireValue::Message(decode_nested(&bytes, content_base, nested, depth + 1)?)
            }
        };

        message.push(number, value);
    }

    Ok(message)
}

fn read_varint(data: &[u8], pos: &mut usize, base: usize) -> WireResult<u64> {
    let start = *pos;
    let mut value = 0u64;

    for i in 0..MAX_VARINT_LEN {
        let byte = *data.get(*pos).ok_or(WireError::Truncated { offset: base + start })?;
        *pos += 1;

        // The tenth byte may only contribute the top bit
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(WireError::VarintOverflow { offset: base + start });
        }

        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }

    Err(WireError::VarintOverflow { offset: base + start })
}

fn read_length_delimited(data: &Bytes, pos: &mut usize, base: usize) -> WireResult<Bytes> {
    let offset = base + *pos;
    let declared = read_varint(data, pos, base)?;
    let available = data.len() - *pos;

    match usize::try_from(declared) {
        Ok(length) if length <= available => {
            let bytes = data.slice(*pos..*pos + length);
            *pos += length;
            Ok(bytes)
        }
        _ => Err(WireError::LengthOverrun {
            offset,
            declared,
            available,
        }),
    }
}

fn read_raw(data: &Bytes, pos: &mut usize, base: usize, wire_type: WireType) -> WireResult<Bytes> {
    match wire_type {
        WireType::Varint => {
            let start = *pos;
            read_varint(data, pos, base)?;
            Ok(data.slice(start..*pos))
        }
        WireType::LengthDelimited => read_length_delimited(data, pos, base),
        WireType::Fixed64 => read_fixed(data, pos, base, 8),
        WireType::Fixed32 => read_fixed(data, pos, base, 4),
    }
}

fn read_fixed(data: &Bytes, pos: &mut usize, base: usize, width: usize) -> WireResult<Bytes> {
    if data.len() - *pos < width {
        return Err(WireError::Truncated { offset: base + *pos });
    }
    let bytes = data.slice(*pos..*pos + width);
    *pos += width;
    Ok(bytes)
}

/// Encode a message; fields ascending, repeated values in order
pub fn encode_message(message: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf);
    buf.freeze()
}

fn encode_into(message: &Message, buf: &mut BytesMut) {
    for (number, value) in message.iter() {
        match value {
            WireValue::UInt(v) => {
                put_key(buf, number, WireType::Varint);
                put_varint(buf, *v);
            }
            WireValue::SInt(v) => {
                put_key(buf, number, WireType::Varint);
                put_varint(buf, zigzag_encode(*v));
            }
            WireValue::Bool(v) => {
                put_key(buf, number, WireType::Varint);
                put_varint(buf, u64::from(*v));
            }
            WireValue::String(s) => put_length_delimited(buf, number, s.as_bytes()),
            WireValue::Bytes(b) => put_length_delimited(buf, number, b),
            WireValue::Message(m) => put_length_delimited(buf, number, &encode_message(m)),
            WireValue::Unknown { wire_type, raw } => {
                if *wire_type == WireType::LengthDelimited {
                    put_length_delimited(buf, number, raw);
                } else {
                    put_key(buf, number, *wire_type);
                    buf.put_slice(raw);
                }
            }
        }
    }
}

fn put_key(buf: &mut BytesMut, number: u32, wire_type: WireType) {
    put_varint(buf, (u64::from(number) << 3) | wire_type as u64);
}

fn put_length_delimited(buf: &mut BytesMut, number: u32, bytes: &[u8]) {
    put_key(buf, number, WireType::LengthDelimited);
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

pub fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
