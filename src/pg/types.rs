//! PostgreSQL type encoding and decoding.
//!
//! This module provides text and binary format codecs for PostgreSQL types.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES
//!
//! Codecs are selected through a [`TypeRegistry`] that maps server type
//! OIDs to a [`TypeKind`]. The registry is built once, never mutated
//! afterwards, and shared by reference between connections. OIDs it does
//! not know decode to [`PgValue::Raw`] instead of failing.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use uuid::Uuid;

use super::array;
use super::datetime::{self, Interval};
use super::numeric::Numeric;
use super::protocol::Format;
use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the type
    pub const UNSPECIFIED: Oid = Oid(0);

    // Boolean types
    pub const BOOL: Oid = Oid(16);

    // Binary data
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    // Text types
    pub const TEXT: Oid = Oid(25);

    // OID type
    pub const OID_TYPE: Oid = Oid(26);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // String types
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const TIMETZ: Oid = Oid(1266);

    // UUID
    pub const UUID: Oid = Oid(2950);

    // JSON types
    pub const JSON: Oid = Oid(114);
    pub const JSONB: Oid = Oid(3802);

    // Numeric
    pub const NUMERIC: Oid = Oid(1700);

    // Array types
    pub const JSON_ARRAY: Oid = Oid(199);
    pub const BOOL_ARRAY: Oid = Oid(1000);
    pub const BYTEA_ARRAY: Oid = Oid(1001);
    pub const CHAR_ARRAY: Oid = Oid(1002);
    pub const NAME_ARRAY: Oid = Oid(1003);
    pub const INT2_ARRAY: Oid = Oid(1005);
    pub const INT4_ARRAY: Oid = Oid(1007);
    pub const TEXT_ARRAY: Oid = Oid(1009);
    pub const BPCHAR_ARRAY: Oid = Oid(1014);
    pub const VARCHAR_ARRAY: Oid = Oid(1015);
    pub const INT8_ARRAY: Oid = Oid(1016);
    pub const FLOAT4_ARRAY: Oid = Oid(1021);
    pub const FLOAT8_ARRAY: Oid = Oid(1022);
    pub const OID_ARRAY: Oid = Oid(1028);
    pub const TIMESTAMP_ARRAY: Oid = Oid(1115);
    pub const DATE_ARRAY: Oid = Oid(1182);
    pub const TIME_ARRAY: Oid = Oid(1183);
    pub const TIMESTAMPTZ_ARRAY: Oid = Oid(1185);
    pub const INTERVAL_ARRAY: Oid = Oid(1187);
    pub const NUMERIC_ARRAY: Oid = Oid(1231);
    pub const TIMETZ_ARRAY: Oid = Oid(1270);
    pub const UUID_ARRAY: Oid = Oid(2951);
    pub const JSONB_ARRAY: Oid = Oid(3807);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

// ============================================================================
// Type Registry
// ============================================================================

/// Codec family of a server type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Bool,
    Int2,
    Int4,
    Int8,
    /// Unsigned 32-bit object identifier, surfaced as `Int8`
    Oid,
    Float4,
    Float8,
    Numeric,
    Text,
    Bytea,
    Uuid,
    Date,
    Time,
    TimeTz,
    Timestamp,
    TimestampTz,
    Interval,
    Json,
    Jsonb,
    /// One-dimensional array of the given element type
    Array(Oid),
}

const BUILTIN_TYPES: &[(Oid, TypeKind)] = &[
    (Oid::BOOL, TypeKind::Bool),
    (Oid::BYTEA, TypeKind::Bytea),
    (Oid::CHAR, TypeKind::Text),
    (Oid::NAME, TypeKind::Text),
    (Oid::INT8, TypeKind::Int8),
    (Oid::INT2, TypeKind::Int2),
    (Oid::INT4, TypeKind::Int4),
    (Oid::TEXT, TypeKind::Text),
    (Oid::OID_TYPE, TypeKind::Oid),
    (Oid::FLOAT4, TypeKind::Float4),
    (Oid::FLOAT8, TypeKind::Float8),
    (Oid::VARCHAR, TypeKind::Text),
    (Oid::BPCHAR, TypeKind::Text),
    (Oid::DATE, TypeKind::Date),
    (Oid::TIME, TypeKind::Time),
    (Oid::TIMESTAMP, TypeKind::Timestamp),
    (Oid::TIMESTAMPTZ, TypeKind::TimestampTz),
    (Oid::INTERVAL, TypeKind::Interval),
    (Oid::TIMETZ, TypeKind::TimeTz),
    (Oid::UUID, TypeKind::Uuid),
    (Oid::JSON, TypeKind::Json),
    (Oid::JSONB, TypeKind::Jsonb),
    (Oid::NUMERIC, TypeKind::Numeric),
    (Oid::JSON_ARRAY, TypeKind::Array(Oid::JSON)),
    (Oid::BOOL_ARRAY, TypeKind::Array(Oid::BOOL)),
    (Oid::BYTEA_ARRAY, TypeKind::Array(Oid::BYTEA)),
    (Oid::CHAR_ARRAY, TypeKind::Array(Oid::CHAR)),
    (Oid::NAME_ARRAY, TypeKind::Array(Oid::NAME)),
    (Oid::INT2_ARRAY, TypeKind::Array(Oid::INT2)),
    (Oid::INT4_ARRAY, TypeKind::Array(Oid::INT4)),
    (Oid::TEXT_ARRAY, TypeKind::Array(Oid::TEXT)),
    (Oid::BPCHAR_ARRAY, TypeKind::Array(Oid::BPCHAR)),
    (Oid::VARCHAR_ARRAY, TypeKind::Array(Oid::VARCHAR)),
    (Oid::INT8_ARRAY, TypeKind::Array(Oid::INT8)),
    (Oid::FLOAT4_ARRAY, TypeKind::Array(Oid::FLOAT4)),
    (Oid::FLOAT8_ARRAY, TypeKind::Array(Oid::FLOAT8)),
    (Oid::OID_ARRAY, TypeKind::Array(Oid::OID_TYPE)),
    (Oid::TIMESTAMP_ARRAY, TypeKind::Array(Oid::TIMESTAMP)),
    (Oid::DATE_ARRAY, TypeKind::Array(Oid::DATE)),
    (Oid::TIME_ARRAY, TypeKind::Array(Oid::TIME)),
    (Oid::TIMESTAMPTZ_ARRAY, TypeKind::Array(Oid::TIMESTAMPTZ)),
    (Oid::INTERVAL_ARRAY, TypeKind::Array(Oid::INTERVAL)),
    (Oid::NUMERIC_ARRAY, TypeKind::Array(Oid::NUMERIC)),
    (Oid::TIMETZ_ARRAY, TypeKind::Array(Oid::TIMETZ)),
    (Oid::UUID_ARRAY, TypeKind::Array(Oid::UUID)),
    (Oid::JSONB_ARRAY, TypeKind::Array(Oid::JSONB)),
];

/// Immutable OID to codec table.
///
/// Extra types (domains, extension types with a text-compatible output)
/// are added while building it, before it is shared:
///
/// ```ignore
/// let registry = TypeRegistry::builtin().with_type(Oid(16_385), TypeKind::Text);
/// ```
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    kinds: HashMap<Oid, TypeKind>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TypeRegistry {
    /// Registry of the built-in scalar types and their array types.
    pub fn builtin() -> Self {
        Self {
            kinds: BUILTIN_TYPES.iter().copied().collect(),
        }
    }

    /// Register (or override) the codec of one OID.
    pub fn with_type(mut self, oid: Oid, kind: TypeKind) -> Self {
        self.kinds.insert(oid, kind);
        self
    }

    #[inline]
    pub fn kind(&self, oid: Oid) -> Option<TypeKind> {
        self.kinds.get(&oid).copied()
    }

    /// Decode one column or array element. `None` is SQL NULL.
    pub fn decode(&self, oid: Oid, format: Format, data: Option<&[u8]>) -> Result<PgValue> {
        let Some(data) = data else {
            return Ok(PgValue::Null);
        };
        let Some(kind) = self.kind(oid) else {
            return Ok(PgValue::Raw {
                oid,
                format,
                data: Bytes::copy_from_slice(data),
            });
        };
        match format {
            Format::Binary => self.decode_binary(kind, data),
            Format::Text => {
                let text = std::str::from_utf8(data)
                    .map_err(|e| Error::Type(format!("Invalid UTF-8 in {:?}: {}", kind, e)))?;
                self.decode_text(kind, text)
            }
        }
    }

    fn decode_binary(&self, kind: TypeKind, data: &[u8]) -> Result<PgValue> {
        Ok(match kind {
            TypeKind::Bool => match data {
                [0] => PgValue::Bool(false),
                [1] => PgValue::Bool(true),
                _ => {
                    return Err(Error::Type(format!(
                        "Invalid BOOL encoding: {:?}",
                        data
                    )))
                }
            },
            TypeKind::Int2 => PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?)),
            TypeKind::Int4 => PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?)),
            TypeKind::Int8 => PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?)),
            TypeKind::Oid => PgValue::Int8(u32::from_be_bytes(fixed(data, "OID")?) as i64),
            TypeKind::Float4 => PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?)),
            TypeKind::Float8 => PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?)),
            TypeKind::Numeric => PgValue::Numeric(Numeric::decode_binary(data)?),
            TypeKind::Text => match std::str::from_utf8(data) {
                Ok(s) => PgValue::Text(s.to_owned()),
                Err(e) => return Err(Error::Type(format!("Invalid UTF-8 in TEXT: {}", e))),
            },
            TypeKind::Bytea => PgValue::Bytea(data.to_vec()),
            TypeKind::Uuid => PgValue::Uuid(
                Uuid::from_slice(data).map_err(|e| Error::Type(format!("Invalid UUID: {}", e)))?,
            ),
            TypeKind::Date => PgValue::Date(datetime::decode_date(data)?),
            TypeKind::Time => PgValue::Time(datetime::decode_time(data)?),
            TypeKind::TimeTz => {
                let (time, offset) = datetime::decode_timetz(data)?;
                PgValue::TimeTz(time, offset)
            }
            TypeKind::Timestamp => PgValue::Timestamp(datetime::decode_timestamp(data)?),
            TypeKind::TimestampTz => PgValue::TimestampTz(datetime::decode_timestamptz(data)?),
            TypeKind::Interval => PgValue::Interval(Interval::decode_binary(data)?),
            TypeKind::Json => PgValue::Json(parse_json(data)?),
            TypeKind::Jsonb => match data.split_first() {
                // JSONB has a version byte prefix
                Some((1, json)) => PgValue::Json(parse_json(json)?),
                _ => return Err(Error::Type("Unsupported JSONB version".to_string())),
            },
            TypeKind::Array(_) => array::decode_binary(self, data)?,
        })
    }

    fn decode_text(&self, kind: TypeKind, text: &str) -> Result<PgValue> {
        let parse_err = |e: &dyn std::fmt::Display| Error::Type(format!("Invalid {:?}: {}", kind, e));
        Ok(match kind {
            TypeKind::Bool => PgValue::Bool(parse_bool(text)?),
            TypeKind::Int2 => PgValue::Int2(text.trim().parse().map_err(|e| parse_err(&e))?),
            TypeKind::Int4 => PgValue::Int4(text.trim().parse().map_err(|e| parse_err(&e))?),
            TypeKind::Int8 => PgValue::Int8(text.trim().parse().map_err(|e| parse_err(&e))?),
            TypeKind::Oid => {
                PgValue::Int8(text.trim().parse::<u32>().map_err(|e| parse_err(&e))? as i64)
            }
            TypeKind::Float4 => PgValue::Float4(text.trim().parse().map_err(|e| parse_err(&e))?),
            TypeKind::Float8 => PgValue::Float8(text.trim().parse().map_err(|e| parse_err(&e))?),
            TypeKind::Numeric => PgValue::Numeric(text.parse()?),
            TypeKind::Text => PgValue::Text(text.to_owned()),
            TypeKind::Bytea => PgValue::Bytea(parse_bytea(text)?),
            TypeKind::Uuid => PgValue::Uuid(Uuid::parse_str(text.trim()).map_err(|e| parse_err(&e))?),
            TypeKind::Date => PgValue::Date(datetime::parse_date(text)?),
            TypeKind::Time => PgValue::Time(datetime::parse_time(text)?),
            TypeKind::TimeTz => {
                let (time, offset) = datetime::parse_timetz(text)?;
                PgValue::TimeTz(time, offset)
            }
            TypeKind::Timestamp => PgValue::Timestamp(datetime::parse_timestamp(text)?),
            TypeKind::TimestampTz => PgValue::TimestampTz(datetime::parse_timestamptz(text)?),
            TypeKind::Interval => PgValue::Interval(text.parse()?),
            TypeKind::Json | TypeKind::Jsonb => PgValue::Json(parse_json(text.as_bytes())?),
            TypeKind::Array(element) => array::decode_text(self, element, text)?,
        })
    }

    /// Encode a bind parameter against the type the server declared for it.
    ///
    /// Known types are coerced and sent in binary; parameters whose declared
    /// type has no codec are sent in text and left to the server to cast.
    /// `Raw` values are sent untouched.
    pub fn encode_param(&self, value: &PgValue, declared: Oid) -> Result<(Format, Option<Bytes>)> {
        if let PgValue::Raw { format, data, .. } = value {
            return Ok((*format, Some(data.clone())));
        }
        if value.is_null() {
            return Ok((Format::Binary, None));
        }
        match self.kind(declared) {
            Some(kind) => {
                let coerced = self.coerce(value, kind)?;
                let mut buf = BytesMut::new();
                self.write_binary(kind, &coerced, &mut buf)?;
                Ok((Format::Binary, Some(buf.freeze())))
            }
            None => Ok((Format::Text, Some(Bytes::from(value.to_text()?)))),
        }
    }

    /// Convert `value` into the variant `kind` encodes.
    ///
    /// Integers widen freely and narrow only when the value fits; integers
    /// and floats convert to `numeric`; text is parsed as the target type.
    pub fn coerce(&self, value: &PgValue, kind: TypeKind) -> Result<PgValue> {
        let mismatch = || {
            Error::Type(format!(
                "Cannot encode {} as {:?}",
                value.type_name(),
                kind
            ))
        };
        let out_of_range = |n: i64| Error::Type(format!("{} out of range for {:?}", n, kind));

        if value.is_null() || value.is_kind(kind) {
            return Ok(value.clone());
        }

        match (kind, value) {
            (TypeKind::Int2, v) if v.as_i64().is_some() => {
                let n = v.as_i64().unwrap_or_default();
                i16::try_from(n).map(PgValue::Int2).map_err(|_| out_of_range(n))
            }
            (TypeKind::Int4, v) if v.as_i64().is_some() => {
                let n = v.as_i64().unwrap_or_default();
                i32::try_from(n).map(PgValue::Int4).map_err(|_| out_of_range(n))
            }
            (TypeKind::Int8, v) if v.as_i64().is_some() => {
                Ok(PgValue::Int8(v.as_i64().unwrap_or_default()))
            }
            (TypeKind::Oid, v) if v.as_i64().is_some() => {
                let n = v.as_i64().unwrap_or_default();
                u32::try_from(n)
                    .map(|_| PgValue::Int8(n))
                    .map_err(|_| out_of_range(n))
            }
            (TypeKind::Float4, v) if v.as_i64().is_some() => {
                Ok(PgValue::Float4(v.as_i64().unwrap_or_default() as f32))
            }
            (TypeKind::Float8, PgValue::Float4(f)) => Ok(PgValue::Float8(*f as f64)),
            (TypeKind::Float8, v) if v.as_i64().is_some() => {
                Ok(PgValue::Float8(v.as_i64().unwrap_or_default() as f64))
            }
            (TypeKind::Numeric, PgValue::Float4(f)) => {
                Ok(PgValue::Numeric(Numeric::try_from(*f as f64)?))
            }
            (TypeKind::Numeric, PgValue::Float8(f)) => Ok(PgValue::Numeric(Numeric::try_from(*f)?)),
            (TypeKind::Numeric, v) if v.as_i64().is_some() => {
                Ok(PgValue::Numeric(Numeric::from(v.as_i64().unwrap_or_default())))
            }
            (TypeKind::Timestamp, PgValue::TimestampTz(ts)) => Ok(PgValue::Timestamp(ts.naive_utc())),
            (TypeKind::Timestamp, PgValue::Date(d)) => {
                Ok(PgValue::Timestamp(d.and_time(NaiveTime::MIN)))
            }
            (TypeKind::TimestampTz, PgValue::Timestamp(ts)) => {
                Ok(PgValue::TimestampTz(Utc.from_utc_datetime(ts)))
            }
            (TypeKind::TimestampTz, PgValue::Date(d)) => Ok(PgValue::TimestampTz(
                Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)),
            )),
            (TypeKind::Array(element), PgValue::Array { values, .. }) => {
                let element_kind = self.kind(element).ok_or_else(mismatch)?;
                let values = values
                    .iter()
                    .map(|v| self.coerce(v, element_kind))
                    .collect::<Result<Vec<_>>>()?;
                Ok(PgValue::Array { element, values })
            }
            (kind, PgValue::Text(text)) => self.decode_text(kind, text),
            _ => Err(mismatch()),
        }
    }

    /// Append the binary form of an already coerced value.
    pub(crate) fn write_binary(&self, kind: TypeKind, value: &PgValue, buf: &mut BytesMut) -> Result<()> {
        match (kind, value) {
            (TypeKind::Bool, PgValue::Bool(v)) => buf.put_u8(*v as u8),
            (TypeKind::Int2, PgValue::Int2(v)) => buf.put_i16(*v),
            (TypeKind::Int4, PgValue::Int4(v)) => buf.put_i32(*v),
            (TypeKind::Int8, PgValue::Int8(v)) => buf.put_i64(*v),
            (TypeKind::Oid, PgValue::Int8(v)) => buf.put_u32(
                u32::try_from(*v).map_err(|_| Error::Type(format!("{} out of range for OID", v)))?,
            ),
            (TypeKind::Float4, PgValue::Float4(v)) => buf.put_f32(*v),
            (TypeKind::Float8, PgValue::Float8(v)) => buf.put_f64(*v),
            (TypeKind::Numeric, PgValue::Numeric(n)) => n.encode_binary(buf),
            (TypeKind::Text, PgValue::Text(s)) => buf.put_slice(s.as_bytes()),
            (TypeKind::Bytea, PgValue::Bytea(b)) => buf.put_slice(b),
            (TypeKind::Uuid, PgValue::Uuid(u)) => buf.put_slice(u.as_bytes()),
            (TypeKind::Date, PgValue::Date(d)) => datetime::encode_date(*d, buf),
            (TypeKind::Time, PgValue::Time(t)) => datetime::encode_time(*t, buf),
            (TypeKind::TimeTz, PgValue::TimeTz(t, o)) => datetime::encode_timetz(*t, *o, buf),
            (TypeKind::Timestamp, PgValue::Timestamp(ts)) => datetime::encode_timestamp(*ts, buf)?,
            (TypeKind::TimestampTz, PgValue::TimestampTz(ts)) => {
                datetime::encode_timestamptz(*ts, buf)?
            }
            (TypeKind::Interval, PgValue::Interval(i)) => i.encode_binary(buf),
            (TypeKind::Json, PgValue::Json(v)) => buf.put_slice(v.to_string().as_bytes()),
            (TypeKind::Jsonb, PgValue::Json(v)) => {
                buf.put_u8(1);
                buf.put_slice(v.to_string().as_bytes());
            }
            (TypeKind::Array(element), PgValue::Array { values, .. }) => {
                array::encode_binary(self, element, values, buf)?
            }
            (kind, value) => {
                return Err(Error::Type(format!(
                    "Cannot encode {} as {:?}",
                    value.type_name(),
                    kind
                )))
            }
        }
        Ok(())
    }
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Numeric),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    TimeTz(NaiveTime, FixedOffset),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Interval(Interval),
    Json(serde_json::Value),
    Array { element: Oid, values: Vec<PgValue> },
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, format: Format, data: Bytes },
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// One-dimensional array; the element type is taken from the first
    /// non-null value and defaults to `text`.
    pub fn array<T: Into<PgValue>>(values: impl IntoIterator<Item = T>) -> Self {
        let values: Vec<PgValue> = values.into_iter().map(Into::into).collect();
        let element = values
            .iter()
            .find(|v| !v.is_null())
            .map(PgValue::type_oid)
            .unwrap_or(Oid::TEXT);
        PgValue::Array { element, values }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::TimeTz(..) => Oid::TIMETZ,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Interval(_) => Oid::INTERVAL,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Array { element, .. } => BUILTIN_TYPES
                .iter()
                .find(|(_, kind)| *kind == TypeKind::Array(*element))
                .map(|(oid, _)| *oid)
                .unwrap_or(Oid::UNSPECIFIED),
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            PgValue::Bool(_) => "bool",
            PgValue::Int2(_) => "int2",
            PgValue::Int4(_) => "int4",
            PgValue::Int8(_) => "int8",
            PgValue::Float4(_) => "float4",
            PgValue::Float8(_) => "float8",
            PgValue::Numeric(_) => "numeric",
            PgValue::Text(_) => "text",
            PgValue::Bytea(_) => "bytea",
            PgValue::Uuid(_) => "uuid",
            PgValue::Date(_) => "date",
            PgValue::Time(_) => "time",
            PgValue::TimeTz(..) => "timetz",
            PgValue::Timestamp(_) => "timestamp",
            PgValue::TimestampTz(_) => "timestamptz",
            PgValue::Interval(_) => "interval",
            PgValue::Json(_) => "json",
            PgValue::Array { .. } => "array",
            PgValue::Raw { .. } => "raw",
        }
    }

    /// Whether this variant is what `kind` decodes to.
    fn is_kind(&self, kind: TypeKind) -> bool {
        matches!(
            (kind, self),
            (TypeKind::Bool, PgValue::Bool(_))
                | (TypeKind::Int2, PgValue::Int2(_))
                | (TypeKind::Int4, PgValue::Int4(_))
                | (TypeKind::Int8, PgValue::Int8(_))
                | (TypeKind::Float4, PgValue::Float4(_))
                | (TypeKind::Float8, PgValue::Float8(_))
                | (TypeKind::Numeric, PgValue::Numeric(_))
                | (TypeKind::Text, PgValue::Text(_))
                | (TypeKind::Bytea, PgValue::Bytea(_))
                | (TypeKind::Uuid, PgValue::Uuid(_))
                | (TypeKind::Date, PgValue::Date(_))
                | (TypeKind::Time, PgValue::Time(_))
                | (TypeKind::TimeTz, PgValue::TimeTz(..))
                | (TypeKind::Timestamp, PgValue::Timestamp(_))
                | (TypeKind::TimestampTz, PgValue::TimestampTz(_))
                | (TypeKind::Interval, PgValue::Interval(_))
                | (TypeKind::Json | TypeKind::Jsonb, PgValue::Json(_))
        )
    }

    /// Text wire form, as the server's output functions would render it.
    pub fn to_text(&self) -> Result<String> {
        Ok(match self {
            PgValue::Null => return Err(Error::Type("NULL has no text form".to_string())),
            PgValue::Bool(v) => (if *v { "t" } else { "f" }).to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => format_float(*v as f64, v.to_string()),
            PgValue::Float8(v) => format_float(*v, v.to_string()),
            PgValue::Numeric(n) => n.to_string(),
            PgValue::Text(s) => s.clone(),
            PgValue::Bytea(b) => format!("\\x{}", hex::encode(b)),
            PgValue::Uuid(u) => u.to_string(),
            PgValue::Date(d) => datetime::format_date(*d),
            PgValue::Time(t) => datetime::format_time(*t),
            PgValue::TimeTz(t, o) => datetime::format_timetz(*t, *o),
            PgValue::Timestamp(ts) => datetime::format_timestamp(*ts),
            PgValue::TimestampTz(ts) => datetime::format_timestamptz(*ts),
            PgValue::Interval(i) => i.to_string(),
            PgValue::Json(v) => v.to_string(),
            PgValue::Array { values, .. } => array::encode_text(values)?,
            PgValue::Raw {
                format: Format::Text,
                data,
                ..
            } => String::from_utf8(data.to_vec())
                .map_err(|e| Error::Type(format!("Invalid UTF-8 in raw value: {}", e)))?,
            PgValue::Raw { oid, .. } => {
                return Err(Error::Type(format!(
                    "Binary value of type {} has no text form",
                    oid.0
                )))
            }
        })
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Any integer variant, widened.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(*v as i64),
            PgValue::Int4(v) => Some(*v as i64),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(*v as f64),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytea(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    Numeric => Numeric,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
    Uuid => Uuid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => Timestamp,
    DateTime<Utc> => TimestampTz,
    Interval => Interval,
    serde_json::Value => Json,
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(PgValue::Null)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Exact-length view of a fixed-width value.
pub(crate) fn fixed<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into()
        .map_err(|_| Error::Type(format!("Invalid {} length: {}", what, data.len())))
}

fn format_float(v: f64, display: String) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        (if v > 0.0 { "Infinity" } else { "-Infinity" }).to_string()
    } else {
        display
    }
}

fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Ok(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::Type(format!("Invalid BOOL: {:?}", text))),
    }
}

fn parse_json(data: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(data).map_err(|e| Error::Type(format!("Invalid JSON: {}", e)))
}

/// Both `bytea_output` forms: `\x` hex and the legacy escape format.
fn parse_bytea(text: &str) -> Result<Vec<u8>> {
    if let Some(digits) = text.strip_prefix("\\x") {
        return hex::decode(digits).map_err(|e| Error::Type(format!("Invalid BYTEA hex: {}", e)));
    }

    let invalid = || Error::Type(format!("Invalid BYTEA escape: {:?}", text));
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
            continue;
        }
        match bytes.get(i + 1..i + 4) {
            Some([a @ b'0'..=b'3', b @ b'0'..=b'7', c @ b'0'..=b'7']) => {
                out.push(((a - b'0') << 6) | ((b - b'0') << 3) | (c - b'0'));
                i += 4;
            }
            _ => return Err(invalid()),
        }
    }
    Ok(out)
}
