// ABOUTME: Defines the tagged Value enum and TypeTag used by every setting in the registry.
// ABOUTME: SettingValue maps concrete Rust types onto Value so registration stays generic and typed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Identifies the value type of a setting. Fixed when the setting is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Bool,
    Int,
    Long,
    String,
    Uuid,
    Timestamp,
    Uri,
}

impl TypeTag {
    /// Lowercase name used in error messages and CLI output.
    pub fn name(&self) -> &'static str {
        match self {
            TypeTag::Bool => "bool",
            TypeTag::Int => "int",
            TypeTag::Long => "long",
            TypeTag::String => "string",
            TypeTag::Uuid => "uuid",
            TypeTag::Timestamp => "timestamp",
            TypeTag::Uri => "uri",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A dynamically typed setting value. The variant always agrees with the
/// owning entry's TypeTag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Bool(bool),
    Int(i32),
    Long(i64),
    String(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Uri(Url),
}

impl Value {
    /// The TypeTag matching this variant.
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Long(_) => TypeTag::Long,
            Value::String(_) => TypeTag::String,
            Value::Uuid(_) => TypeTag::Uuid,
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::Uri(_) => TypeTag::Uri,
        }
    }

    /// Parse user-supplied text as a value of the given type.
    /// Booleans accept true/false, 1/0, yes/no and on/off.
    pub fn parse_as(tag: TypeTag, input: &str) -> Result<Value, ParseValueError> {
        let trimmed = input.trim();
        let invalid = |message: String| ParseValueError {
            tag,
            input: input.to_string(),
            message,
        };

        match tag {
            TypeTag::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(invalid("expected a boolean".to_string())),
            },
            TypeTag::Int => trimmed
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|e| invalid(e.to_string())),
            TypeTag::Long => trimmed
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|e| invalid(e.to_string())),
            TypeTag::String => Ok(Value::String(input.to_string())),
            TypeTag::Uuid => Uuid::parse_str(trimmed)
                .map(Value::Uuid)
                .map_err(|e| invalid(e.to_string())),
            TypeTag::Timestamp => DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|e| invalid(e.to_string())),
            TypeTag::Uri => Url::parse(trimmed)
                .map(Value::Uri)
                .map_err(|e| invalid(e.to_string())),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Long(l) => write!(f, "{}", l),
            Value::String(s) => f.write_str(s),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Timestamp(ts) => f.write_str(&ts.to_rfc3339()),
            Value::Uri(u) => f.write_str(u.as_str()),
        }
    }
}

/// Failure to parse text into a typed Value.
#[derive(Debug, Error)]
#[error("cannot parse {input:?} as {tag}: {message}")]
pub struct ParseValueError {
    pub tag: TypeTag,
    pub input: String,
    pub message: String,
}

/// A Rust type that can be stored in the setting registry.
pub trait SettingValue: Clone + PartialEq + Send + Sync + 'static {
    const TAG: TypeTag;

    fn into_value(self) -> Value;

    /// Returns None when the value carries a different variant.
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! setting_value {
    ($ty:ty, $variant:ident) => {
        impl SettingValue for $ty {
            const TAG: TypeTag = TypeTag::$variant;

            fn into_value(self) -> Value {
                Value::$variant(self)
            }

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

setting_value!(bool, Bool);
setting_value!(i32, Int);
setting_value!(i64, Long);
setting_value!(String, String);
setting_value!(Uuid, Uuid);
setting_value!(DateTime<Utc>, Timestamp);
setting_value!(Url, Uri);
