use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Typed value carried by a message field.
///
/// Signed and unsigned widths stay distinct: the codec writes the signedness
/// flag from the variant, and decoding restores the same variant.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f64),
    String(String),
    Binary(Vec<u8>),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int16(_) => "int16",
            Self::UInt16(_) => "uint16",
            Self::Int32(_) => "int32",
            Self::UInt32(_) => "uint32",
            Self::Int64(_) => "int64",
            Self::UInt64(_) => "uint64",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Binary(_) => "binary",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int16(value) => Some(i64::from(value)),
            Self::UInt16(value) => Some(i64::from(value)),
            Self::Int32(value) => Some(i64::from(value)),
            Self::UInt32(value) => Some(i64::from(value)),
            Self::Int64(value) => Some(value),
            Self::UInt64(value) => i64::try_from(value).ok(),
            Self::Timestamp(value) => Some(value.timestamp_millis()),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_i64().and_then(|value| u32::try_from(value).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(value) => Some(*value),
            Self::Binary(bytes) => Uuid::from_slice(bytes).ok(),
            Self::String(text) => Uuid::parse_str(text).ok(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(value) => Some(*value),
            Self::Int64(_) | Self::UInt64(_) => {
                self.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis)
            }
            _ => None,
        }
    }
}

macro_rules! field_value_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for FieldValue {
                fn from(value: $source) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

field_value_from!(
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Float,
    String => String,
    Vec<u8> => Binary,
    Uuid => Uuid,
    DateTime<Utc> => Timestamp,
);

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::UInt16(u16::from(value))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Fields(BTreeMap<u32, FieldValue>),
    Control(u32),
}

/// One protocol message. Field ids are unique; encoding order is by id.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub code: u16,
    pub id: u32,
    pub body: Body,
}

impl Message {
    pub fn new(code: u16, id: u32) -> Self {
        Self {
            code,
            id,
            body: Body::Fields(BTreeMap::new()),
        }
    }

    pub fn control(code: u16, id: u32, value: u32) -> Self {
        Self {
            code,
            id,
            body: Body::Control(value),
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.body, Body::Control(_))
    }

    pub fn control_value(&self) -> Option<u32> {
        match self.body {
            Body::Control(value) => Some(value),
            Body::Fields(_) => None,
        }
    }

    // Turns a control message into a field message; no-op otherwise.
    pub fn set(&mut self, field_id: u32, value: impl Into<FieldValue>) -> &mut Self {
        if let Body::Control(_) = self.body {
            self.body = Body::Fields(BTreeMap::new());
        }
        if let Body::Fields(fields) = &mut self.body {
            fields.insert(field_id, value.into());
        }
        self
    }

    pub fn with(mut self, field_id: u32, value: impl Into<FieldValue>) -> Self {
        self.set(field_id, value);
        self
    }

    pub fn get(&self, field_id: u32) -> Option<&FieldValue> {
        match &self.body {
            Body::Fields(fields) => fields.get(&field_id),
            Body::Control(_) => None,
        }
    }

    pub fn remove(&mut self, field_id: u32) -> Option<FieldValue> {
        match &mut self.body {
            Body::Fields(fields) => fields.remove(&field_id),
            Body::Control(_) => None,
        }
    }

    pub fn contains(&self, field_id: u32) -> bool {
        self.get(field_id).is_some()
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &FieldValue)> {
        let fields = match &self.body {
            Body::Fields(fields) => Some(fields),
            Body::Control(_) => None,
        };
        fields
            .into_iter()
            .flat_map(|fields| fields.iter().map(|(id, value)| (*id, value)))
    }

    pub fn field_count(&self) -> usize {
        match &self.body {
            Body::Fields(fields) => fields.len(),
            Body::Control(_) => 0,
        }
    }

    pub fn get_i64(&self, field_id: u32) -> Option<i64> {
        self.get(field_id).and_then(FieldValue::as_i64)
    }

    pub fn get_u32(&self, field_id: u32) -> Option<u32> {
        self.get(field_id).and_then(FieldValue::as_u32)
    }

    pub fn get_str(&self, field_id: u32) -> Option<&str> {
        self.get(field_id).and_then(FieldValue::as_str)
    }

    pub fn get_bytes(&self, field_id: u32) -> Option<&[u8]> {
        self.get(field_id).and_then(FieldValue::as_bytes)
    }

    pub fn get_uuid(&self, field_id: u32) -> Option<Uuid> {
        self.get(field_id).and_then(FieldValue::as_uuid)
    }

    pub fn get_timestamp(&self, field_id: u32) -> Option<DateTime<Utc>> {
        self.get(field_id).and_then(FieldValue::as_timestamp)
    }
}
