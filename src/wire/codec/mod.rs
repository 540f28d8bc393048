use std::collections::BTreeMap;
use std::fmt;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::wire::message::{Body, FieldValue, Message};

pub const MAX_MESSAGE_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const HEADER_SIZE_BYTES: usize = 16;
pub const FIELD_HEADER_SIZE_BYTES: usize = 12;

pub const FLAG_CONTROL: u16 = 0x0020;
pub const FIELD_FLAG_SIGNED: u8 = 0x01;

const TYPE_INT32: u8 = 0;
const TYPE_STRING: u8 = 1;
const TYPE_INT64: u8 = 2;
const TYPE_INT16: u8 = 3;
const TYPE_BINARY: u8 = 4;
const TYPE_FLOAT: u8 = 5;
const TYPE_UUID: u8 = 8;
const TYPE_TIMESTAMP: u8 = 9;

/// Frame-level failures. Any of these means the byte stream can no longer be
/// trusted and the connection has to be dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    MessageTooLarge { size: usize, limit: usize },
    DeclaredSizeTooSmall { declared: usize },
    MisalignedSize { declared: usize },
    DeclaredSizeTooLarge { declared: usize, limit: usize },
    FieldTooLarge { field_id: u32, size: usize },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLarge { size, limit } => {
                write!(f, "encoded message size {size} exceeds limit {limit}")
            }
            Self::DeclaredSizeTooSmall { declared } => write!(
                f,
                "protocol error: declared message size {declared} is smaller than {HEADER_SIZE_BYTES}-byte header"
            ),
            Self::MisalignedSize { declared } => write!(
                f,
                "protocol error: declared message size {declared} is not 8-byte aligned"
            ),
            Self::DeclaredSizeTooLarge { declared, limit } => write!(
                f,
                "protocol error: declared message size {declared} exceeds max {limit}"
            ),
            Self::FieldTooLarge { field_id, size } => {
                write!(f, "field {field_id} value of {size} bytes cannot be framed")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Problems confined to one field; the rest of the message is still usable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldError {
    UnknownType { field_id: u32, type_tag: u8 },
    InvalidLength { field_id: u32, type_tag: u8, length: usize },
    InvalidUtf8 { field_id: u32 },
    Truncated { field_id: u32, declared: usize, available: usize },
    MissingFields { expected: u32, found: u32 },
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType { field_id, type_tag } => {
                write!(f, "field {field_id} has unknown type tag {type_tag}")
            }
            Self::InvalidLength {
                field_id,
                type_tag,
                length,
            } => write!(
                f,
                "field {field_id} of type {type_tag} has invalid value length {length}"
            ),
            Self::InvalidUtf8 { field_id } => write!(f, "field {field_id} is not valid UTF-8"),
            Self::Truncated {
                field_id,
                declared,
                available,
            } => write!(
                f,
                "field {field_id} declares {declared} value bytes but only {available} remain"
            ),
            Self::MissingFields { expected, found } => write!(
                f,
                "header announced {expected} fields but only {found} fit in the message"
            ),
        }
    }
}

impl std::error::Error for FieldError {}

#[derive(Clone, Debug, PartialEq)]
pub struct DecodedMessage {
    pub message: Message,
    pub consumed: usize,
    pub field_errors: Vec<FieldError>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DecodeStatus {
    Incomplete { needed: usize },
    Complete(DecodedMessage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WireCodec {
    max_message_size_bytes: usize,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE_BYTES)
    }
}

impl WireCodec {
    pub fn new(max_message_size_bytes: usize) -> Self {
        Self {
            max_message_size_bytes: max_message_size_bytes.max(HEADER_SIZE_BYTES),
        }
    }

    pub fn from_app_config(app_config: &AppConfig) -> Self {
        Self::new(app_config.wire.max_message_size_bytes)
    }

    pub fn max_message_size_bytes(&self) -> usize {
        self.max_message_size_bytes
    }

    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        let (flags, trailer) = match &message.body {
            Body::Control(value) => (FLAG_CONTROL, *value),
            Body::Fields(fields) => {
                for (field_id, value) in fields {
                    encode_field(&mut body, *field_id, value)?;
                }
                (0, fields.len() as u32)
            }
        };

        let size = HEADER_SIZE_BYTES + body.len();
        if size > self.max_message_size_bytes {
            return Err(CodecError::MessageTooLarge {
                size,
                limit: self.max_message_size_bytes,
            });
        }

        let mut frame = Vec::with_capacity(size);
        frame.extend_from_slice(&message.code.to_be_bytes());
        frame.extend_from_slice(&flags.to_be_bytes());
        frame.extend_from_slice(&(size as u32).to_be_bytes());
        frame.extend_from_slice(&message.id.to_be_bytes());
        frame.extend_from_slice(&trailer.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    // Decodes the first message in `bytes`, or reports how many more bytes it needs.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodeStatus, CodecError> {
        if bytes.len() < HEADER_SIZE_BYTES {
            return Ok(DecodeStatus::Incomplete {
                needed: HEADER_SIZE_BYTES - bytes.len(),
            });
        }

        let code = read_u16(bytes, 0);
        let flags = read_u16(bytes, 2);
        let declared = read_u32(bytes, 4) as usize;
        let id = read_u32(bytes, 8);
        let trailer = read_u32(bytes, 12);

        if declared < HEADER_SIZE_BYTES {
            return Err(CodecError::DeclaredSizeTooSmall { declared });
        }
        if declared % 8 != 0 {
            return Err(CodecError::MisalignedSize { declared });
        }
        if declared > self.max_message_size_bytes {
            return Err(CodecError::DeclaredSizeTooLarge {
                declared,
                limit: self.max_message_size_bytes,
            });
        }
        if bytes.len() < declared {
            return Ok(DecodeStatus::Incomplete {
                needed: declared - bytes.len(),
            });
        }

        if flags & FLAG_CONTROL != 0 {
            return Ok(DecodeStatus::Complete(DecodedMessage {
                message: Message::control(code, id, trailer),
                consumed: declared,
                field_errors: Vec::new(),
            }));
        }

        let (fields, field_errors) = decode_fields(&bytes[HEADER_SIZE_BYTES..declared], trailer);
        Ok(DecodeStatus::Complete(DecodedMessage {
            message: Message {
                code,
                id,
                body: Body::Fields(fields),
            },
            consumed: declared,
            field_errors,
        }))
    }
}

/// Accumulates transport reads until whole messages are available.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn next_message(&mut self, codec: &WireCodec) -> Result<Option<DecodedMessage>, CodecError> {
        match codec.decode(&self.buffer)? {
            DecodeStatus::Incomplete { .. } => Ok(None),
            DecodeStatus::Complete(decoded) => {
                let _ = self.buffer.split_to(decoded.consumed);
                Ok(Some(decoded))
            }
        }
    }
}

fn encode_field(out: &mut Vec<u8>, field_id: u32, value: &FieldValue) -> Result<(), CodecError> {
    let (type_tag, signed, payload): (u8, bool, Vec<u8>) = match value {
        FieldValue::Int16(v) => (TYPE_INT16, true, v.to_be_bytes().to_vec()),
        FieldValue::UInt16(v) => (TYPE_INT16, false, v.to_be_bytes().to_vec()),
        FieldValue::Int32(v) => (TYPE_INT32, true, v.to_be_bytes().to_vec()),
        FieldValue::UInt32(v) => (TYPE_INT32, false, v.to_be_bytes().to_vec()),
        FieldValue::Int64(v) => (TYPE_INT64, true, v.to_be_bytes().to_vec()),
        FieldValue::UInt64(v) => (TYPE_INT64, false, v.to_be_bytes().to_vec()),
        FieldValue::Float(v) => (TYPE_FLOAT, true, v.to_bits().to_be_bytes().to_vec()),
        FieldValue::String(v) => (TYPE_STRING, false, v.as_bytes().to_vec()),
        FieldValue::Binary(v) => (TYPE_BINARY, false, v.clone()),
        FieldValue::Uuid(v) => (TYPE_UUID, false, v.as_bytes().to_vec()),
        FieldValue::Timestamp(v) => (
            TYPE_TIMESTAMP,
            true,
            v.timestamp_millis().to_be_bytes().to_vec(),
        ),
    };

    let length = u32::try_from(payload.len()).map_err(|_| CodecError::FieldTooLarge {
        field_id,
        size: payload.len(),
    })?;

    out.extend_from_slice(&field_id.to_be_bytes());
    out.push(type_tag);
    out.push(if signed { FIELD_FLAG_SIGNED } else { 0 });
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&payload);
    let padded = padded_len(FIELD_HEADER_SIZE_BYTES + payload.len());
    out.resize(out.len() + padded - FIELD_HEADER_SIZE_BYTES - payload.len(), 0);
    Ok(())
}

fn decode_fields(body: &[u8], announced: u32) -> (BTreeMap<u32, FieldValue>, Vec<FieldError>) {
    let mut fields = BTreeMap::new();
    let mut errors = Vec::new();
    let mut offset = 0;
    let mut found = 0_u32;

    while found < announced {
        if body.len() - offset < FIELD_HEADER_SIZE_BYTES {
            errors.push(FieldError::MissingFields {
                expected: announced,
                found,
            });
            break;
        }

        let field_id = read_u32(body, offset);
        let type_tag = body[offset + 4];
        let signed = body[offset + 5] & FIELD_FLAG_SIGNED != 0;
        let length = read_u32(body, offset + 8) as usize;
        let value_start = offset + FIELD_HEADER_SIZE_BYTES;
        let available = body.len() - value_start;
        if length > available {
            errors.push(FieldError::Truncated {
                field_id,
                declared: length,
                available,
            });
            break;
        }

        let raw = &body[value_start..value_start + length];
        match decode_value(field_id, type_tag, signed, raw) {
            Ok(value) => {
                fields.insert(field_id, value);
            }
            Err(error) => errors.push(error),
        }

        found += 1;
        offset = (offset + padded_len(FIELD_HEADER_SIZE_BYTES + length)).min(body.len());
    }

    (fields, errors)
}

fn decode_value(field_id: u32, type_tag: u8, signed: bool, raw: &[u8]) -> Result<FieldValue, FieldError> {
    let invalid_length = || FieldError::InvalidLength {
        field_id,
        type_tag,
        length: raw.len(),
    };

    match type_tag {
        TYPE_INT16 => {
            let bytes: [u8; 2] = raw.try_into().map_err(|_| invalid_length())?;
            Ok(if signed {
                FieldValue::Int16(i16::from_be_bytes(bytes))
            } else {
                FieldValue::UInt16(u16::from_be_bytes(bytes))
            })
        }
        TYPE_INT32 => {
            let bytes: [u8; 4] = raw.try_into().map_err(|_| invalid_length())?;
            Ok(if signed {
                FieldValue::Int32(i32::from_be_bytes(bytes))
            } else {
                FieldValue::UInt32(u32::from_be_bytes(bytes))
            })
        }
        TYPE_INT64 => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| invalid_length())?;
            Ok(if signed {
                FieldValue::Int64(i64::from_be_bytes(bytes))
            } else {
                FieldValue::UInt64(u64::from_be_bytes(bytes))
            })
        }
        TYPE_FLOAT => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| invalid_length())?;
            Ok(FieldValue::Float(f64::from_bits(u64::from_be_bytes(bytes))))
        }
        TYPE_STRING => String::from_utf8(raw.to_vec())
            .map(FieldValue::String)
            .map_err(|_| FieldError::InvalidUtf8 { field_id }),
        TYPE_BINARY => Ok(FieldValue::Binary(raw.to_vec())),
        TYPE_UUID => Uuid::from_slice(raw)
            .map(FieldValue::Uuid)
            .map_err(|_| invalid_length()),
        TYPE_TIMESTAMP => {
            let bytes: [u8; 8] = raw.try_into().map_err(|_| invalid_length())?;
            DateTime::<Utc>::from_timestamp_millis(i64::from_be_bytes(bytes))
                .map(FieldValue::Timestamp)
                .ok_or_else(invalid_length)
        }
        _ => Err(FieldError::UnknownType { field_id, type_tag }),
    }
}

fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}
