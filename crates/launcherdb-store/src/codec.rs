// ABOUTME: Codec registry marshaling typed setting values to and from SQLite column values.
// ABOUTME: One codec per TypeTag, selected by tag; entity rows reuse the same encodings for shared types.

use chrono::{DateTime, SecondsFormat, Utc};
use launcherdb_core::{TypeTag, Value};
use rusqlite::types::{Value as SqlValue, ValueRef};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Errors that can occur while encoding or decoding a column.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("expected {expected} column, found {found}")]
    UnexpectedColumn {
        expected: TypeTag,
        found: &'static str,
    },

    #[error("cannot decode {tag} column: {message}")]
    Parse { tag: TypeTag, message: String },

    #[error("{tag} value out of range: {value}")]
    OutOfRange { tag: TypeTag, value: i64 },

    #[error("codec for {expected} given a {actual} value")]
    ValueMismatch { expected: TypeTag, actual: TypeTag },
}

/// Marshals one value type between memory and its column representation.
pub trait ColumnCodec: Sync {
    fn tag(&self) -> TypeTag;

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError>;

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError>;
}

struct BoolCodec;
struct IntCodec;
struct LongCodec;
struct StringCodec;
struct UuidCodec;
struct TimestampCodec;
struct UriCodec;

static BOOL_CODEC: BoolCodec = BoolCodec;
static INT_CODEC: IntCodec = IntCodec;
static LONG_CODEC: LongCodec = LongCodec;
static STRING_CODEC: StringCodec = StringCodec;
static UUID_CODEC: UuidCodec = UuidCodec;
static TIMESTAMP_CODEC: TimestampCodec = TimestampCodec;
static URI_CODEC: UriCodec = UriCodec;

/// Look up the codec for a type tag.
pub fn codec_for(tag: TypeTag) -> &'static dyn ColumnCodec {
    match tag {
        TypeTag::Bool => &BOOL_CODEC,
        TypeTag::Int => &INT_CODEC,
        TypeTag::Long => &LONG_CODEC,
        TypeTag::String => &STRING_CODEC,
        TypeTag::Uuid => &UUID_CODEC,
        TypeTag::Timestamp => &TIMESTAMP_CODEC,
        TypeTag::Uri => &URI_CODEC,
    }
}

/// Encode a value with the codec matching its own tag.
pub fn encode_value(value: &Value) -> Result<SqlValue, CodecError> {
    codec_for(value.tag()).encode(value)
}

/// Decode a column as the given type.
pub fn decode_value(tag: TypeTag, column: ValueRef<'_>) -> Result<Value, CodecError> {
    codec_for(tag).decode(column)
}

fn column_kind(column: ValueRef<'_>) -> &'static str {
    match column {
        ValueRef::Null => "null",
        ValueRef::Integer(_) => "integer",
        ValueRef::Real(_) => "real",
        ValueRef::Text(_) => "text",
        ValueRef::Blob(_) => "blob",
    }
}

fn mismatch(expected: TypeTag, value: &Value) -> CodecError {
    CodecError::ValueMismatch {
        expected,
        actual: value.tag(),
    }
}

fn integer(tag: TypeTag, column: ValueRef<'_>) -> Result<i64, CodecError> {
    match column {
        ValueRef::Integer(i) => Ok(i),
        other => Err(CodecError::UnexpectedColumn {
            expected: tag,
            found: column_kind(other),
        }),
    }
}

fn text(tag: TypeTag, column: ValueRef<'_>) -> Result<&str, CodecError> {
    match column {
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).map_err(|e| CodecError::Parse {
            tag,
            message: e.to_string(),
        }),
        other => Err(CodecError::UnexpectedColumn {
            expected: tag,
            found: column_kind(other),
        }),
    }
}

impl ColumnCodec for BoolCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Bool
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        integer(self.tag(), column).map(|i| Value::Bool(i != 0))
    }
}

impl ColumnCodec for IntCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Int
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Int(i) => Ok(SqlValue::Integer(i64::from(*i))),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        let raw = integer(self.tag(), column)?;
        i32::try_from(raw)
            .map(Value::Int)
            .map_err(|_| CodecError::OutOfRange {
                tag: self.tag(),
                value: raw,
            })
    }
}

impl ColumnCodec for LongCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Long
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Long(l) => Ok(SqlValue::Integer(*l)),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        integer(self.tag(), column).map(Value::Long)
    }
}

impl ColumnCodec for StringCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::String
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    // NULL decodes as the empty string, matching how an unset string setting reads.
    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        match column {
            ValueRef::Null => Ok(Value::String(String::new())),
            other => text(self.tag(), other).map(|s| Value::String(s.to_string())),
        }
    }
}

impl ColumnCodec for UuidCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Uuid
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Uuid(u) => Ok(SqlValue::Text(uuid_column(u))),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        let raw = text(self.tag(), column)?;
        Uuid::parse_str(raw)
            .map(Value::Uuid)
            .map_err(|e| CodecError::Parse {
                tag: self.tag(),
                message: e.to_string(),
            })
    }
}

impl ColumnCodec for TimestampCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Timestamp
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Timestamp(ts) => Ok(SqlValue::Text(timestamp_column(ts))),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        let raw = text(self.tag(), column)?;
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|e| CodecError::Parse {
                tag: self.tag(),
                message: e.to_string(),
            })
    }
}

impl ColumnCodec for UriCodec {
    fn tag(&self) -> TypeTag {
        TypeTag::Uri
    }

    fn encode(&self, value: &Value) -> Result<SqlValue, CodecError> {
        match value {
            Value::Uri(u) => Ok(SqlValue::Text(u.as_str().to_string())),
            other => Err(mismatch(self.tag(), other)),
        }
    }

    fn decode(&self, column: ValueRef<'_>) -> Result<Value, CodecError> {
        let raw = text(self.tag(), column)?;
        Url::parse(raw)
            .map(Value::Uri)
            .map_err(|e| CodecError::Parse {
                tag: self.tag(),
                message: e.to_string(),
            })
    }
}

/// Column text for a UUID.
pub fn uuid_column(id: &Uuid) -> String {
    id.hyphenated().to_string()
}

/// Column text for a timestamp: RFC 3339 in UTC, keeping sub-second digits only when present.
pub fn timestamp_column(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn conversion_error(idx: usize, tag: TypeTag, err: CodecError) -> rusqlite::Error {
    let sql_type = match tag {
        TypeTag::Bool | TypeTag::Int | TypeTag::Long => rusqlite::types::Type::Integer,
        _ => rusqlite::types::Type::Text,
    };
    rusqlite::Error::FromSqlConversionFailure(idx, sql_type, Box::new(err))
}

/// Read a UUID column from a row.
pub fn read_uuid(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    match decode_value(TypeTag::Uuid, row.get_ref(idx)?) {
        Ok(Value::Uuid(u)) => Ok(u),
        Ok(other) => Err(conversion_error(idx, TypeTag::Uuid, mismatch(TypeTag::Uuid, &other))),
        Err(e) => Err(conversion_error(idx, TypeTag::Uuid, e)),
    }
}

/// Read a timestamp column from a row.
pub fn read_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    match decode_value(TypeTag::Timestamp, row.get_ref(idx)?) {
        Ok(Value::Timestamp(ts)) => Ok(ts),
        Ok(other) => Err(conversion_error(
            idx,
            TypeTag::Timestamp,
            mismatch(TypeTag::Timestamp, &other),
        )),
        Err(e) => Err(conversion_error(idx, TypeTag::Timestamp, e)),
    }
}

/// Read a URI column from a row.
pub fn read_uri(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Url> {
    match decode_value(TypeTag::Uri, row.get_ref(idx)?) {
        Ok(Value::Uri(u)) => Ok(u),
        Ok(other) => Err(conversion_error(idx, TypeTag::Uri, mismatch(TypeTag::Uri, &other))),
        Err(e) => Err(conversion_error(idx, TypeTag::Uri, e)),
    }
}
