//! Dynamically typed column values.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::types::{FormatCode, Oid, oid};

use super::array::Array;
use super::bytes::decode_bytea_text;
use super::primitives::{parse_bool, read_binary_int};
use super::timestamp::{self, is_unmapped_infinity};
use super::{FromWireValue, ToWireValue, utf8};

/// A column value decoded by its type OID.
///
/// Types without a dedicated variant decode to [`Value::Text`], as do
/// `infinity` timestamps when no sentinels are enabled.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Date(NaiveDate),
    Array(Array),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer variant, widened.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Int2(v) => Some(i64::from(v)),
            Value::Int4(v) => Some(i64::from(v)),
            Value::Int8(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytea(b) => Some(b),
            _ => None,
        }
    }
}

/// Decode one column. `None` is SQL NULL.
pub fn decode(bytes: Option<&[u8]>, oid: Oid, format: FormatCode) -> Result<Value> {
    match (bytes, format) {
        (None, _) => Ok(Value::Null),
        (Some(bytes), FormatCode::Text) => Value::from_text(oid, bytes),
        (Some(bytes), FormatCode::Binary) => Value::from_binary(oid, bytes),
    }
}

impl FromWireValue<'_> for Value {
    fn from_null() -> Result<Self> {
        Ok(Value::Null)
    }

    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        let value = match oid {
            oid::BOOL => Value::Bool(parse_bool(bytes)?),
            oid::INT2 => Value::Int2(i16::from_text(oid, bytes)?),
            oid::INT4 => Value::Int4(i32::from_text(oid, bytes)?),
            oid::INT8 => Value::Int8(i64::from_text(oid, bytes)?),
            oid::OID => Value::Int8(i64::from(u32::from_text(oid, bytes)?)),
            oid::FLOAT4 => Value::Float4(f32::from_text(oid, bytes)?),
            oid::FLOAT8 => Value::Float8(f64::from_text(oid, bytes)?),
            oid::BYTEA => Value::Bytea(decode_bytea_text(bytes)?),
            oid::UUID => Value::Uuid(Uuid::from_text(oid, bytes)?),
            oid::TIMESTAMP | oid::TIMESTAMPTZ | oid::DATE if is_unmapped_infinity(bytes) => {
                Value::Text(utf8(bytes)?.to_owned())
            }
            oid::TIMESTAMP => Value::Timestamp(timestamp::parse_timestamp(bytes)?),
            oid::TIMESTAMPTZ => Value::TimestampTz(timestamp::parse_timestamptz(bytes)?),
            oid::DATE => Value::Date(timestamp::parse_date(bytes)?),
            _ => match oid::array_element(oid) {
                Some(elem) => Value::Array(Array::decode_text(elem, bytes)?),
                None => Value::Text(utf8(bytes)?.to_owned()),
            },
        };
        Ok(value)
    }

    fn from_binary(oid: Oid, bytes: &[u8]) -> Result<Self> {
        let value = match oid {
            oid::BYTEA => Value::Bytea(bytes.to_vec()),
            oid::INT2 => Value::Int2(read_binary_int(oid, bytes)? as i16),
            oid::INT4 => Value::Int4(read_binary_int(oid, bytes)? as i32),
            oid::INT8 => Value::Int8(read_binary_int(oid, bytes)?),
            oid::UUID => Value::Uuid(Uuid::from_binary(oid, bytes)?),
            _ => {
                return Err(Error::Unsupported(format!(
                    "binary format for oid {}",
                    oid
                )));
            }
        };
        Ok(value)
    }
}

impl ToWireValue for Value {
    fn natural_oid(&self) -> Oid {
        match self {
            Value::Null => 0,
            Value::Bool(_) => oid::BOOL,
            Value::Int2(_) => oid::INT2,
            Value::Int4(_) => oid::INT4,
            Value::Int8(_) => oid::INT8,
            Value::Float4(_) => oid::FLOAT4,
            Value::Float8(_) => oid::FLOAT8,
            Value::Text(_) => oid::TEXT,
            Value::Bytea(_) => oid::BYTEA,
            Value::Uuid(_) => oid::UUID,
            Value::Timestamp(_) => oid::TIMESTAMP,
            Value::TimestampTz(_) => oid::TIMESTAMPTZ,
            Value::Date(_) => oid::DATE,
            Value::Array(a) => a.natural_oid(),
        }
    }

    fn is_null(&self) -> bool {
        Value::is_null(self)
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Value::Null => Ok(()),
            Value::Bool(v) => v.write_text(buf),
            Value::Int2(v) => v.write_text(buf),
            Value::Int4(v) => v.write_text(buf),
            Value::Int8(v) => v.write_text(buf),
            Value::Float4(v) => v.write_text(buf),
            Value::Float8(v) => v.write_text(buf),
            Value::Text(v) => v.write_text(buf),
            Value::Bytea(v) => v.write_text(buf),
            Value::Uuid(v) => v.write_text(buf),
            Value::Timestamp(v) => v.write_text(buf),
            Value::TimestampTz(v) => v.write_text(buf),
            Value::Date(v) => v.write_text(buf),
            Value::Array(v) => v.write_text(buf),
        }
    }

    fn prefers_binary(&self) -> bool {
        matches!(self, Value::Bytea(_))
    }

    fn write_binary(&self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Value::Bytea(v) => v.write_binary(buf),
            other => Err(Error::Encode(format!(
                "no binary encoding for oid {}",
                other.natural_oid()
            ))),
        }
    }
}

macro_rules! impl_from {
    ($($t:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v.into())
                }
            }
        )+
    };
}

impl_from!(
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    Uuid => Uuid,
    NaiveDateTime => Timestamp,
    DateTime<FixedOffset> => TimestampTz,
    NaiveDate => Date,
    Array => Array,
);

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
