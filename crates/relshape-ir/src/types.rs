//! Domain types, value converters, and type mappings.
//!
//! A [`TypeMapping`] describes how a column's stored (provider) value relates
//! to the value the application sees. When a [`ValueConverter`] is present the
//! stored representation differs from the domain one, e.g. a boolean stored as
//! `'Y'`/`'N'`.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::value::Value;

/// The domain-level type of an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DomainType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Timestamp,
    Uuid,
}

impl DomainType {
    /// Whether a (non-null) value is an acceptable instance of this type.
    ///
    /// Integer and float widths widen; nothing narrows.
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (DomainType::Bool, Value::Bool(_))
                | (DomainType::Int32, Value::Int32(_))
                | (DomainType::Int64, Value::Int32(_) | Value::Int64(_))
                | (DomainType::Float32, Value::Float32(_))
                | (DomainType::Float64, Value::Float32(_) | Value::Float64(_))
                | (DomainType::String, Value::String(_))
                | (DomainType::Bytes, Value::Bytes(_))
                | (DomainType::Timestamp, Value::Timestamp(_))
                | (DomainType::Uuid, Value::Uuid(_))
        )
    }

    /// Widen an accepted value to the canonical variant for this type.
    pub fn coerce(&self, value: Value) -> Value {
        match (self, value) {
            (DomainType::Int64, Value::Int32(i)) => Value::Int64(i as i64),
            (DomainType::Float64, Value::Float32(f)) => Value::Float64(f as f64),
            (_, v) => v,
        }
    }
}

/// Conversion between a domain value and its stored representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValueConverter {
    /// Boolean stored as one of two strings.
    BoolToString {
        false_value: String,
        true_value: String,
    },
    /// Boolean stored as `0`/`1`.
    BoolToZeroOne,
    /// 64-bit integer stored as its decimal string.
    NumberToString,
    /// UUID stored as a hex string.
    UuidToString,
}

impl ValueConverter {
    /// Common `'Y'`/`'N'` boolean encoding.
    pub fn yes_no() -> Self {
        ValueConverter::BoolToString {
            false_value: "N".to_string(),
            true_value: "Y".to_string(),
        }
    }

    /// Short name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ValueConverter::BoolToString { .. } => "BoolToString",
            ValueConverter::BoolToZeroOne => "BoolToZeroOne",
            ValueConverter::NumberToString => "NumberToString",
            ValueConverter::UuidToString => "UuidToString",
        }
    }

    /// The domain type this converter produces.
    pub fn model_type(&self) -> DomainType {
        match self {
            ValueConverter::BoolToString { .. } | ValueConverter::BoolToZeroOne => DomainType::Bool,
            ValueConverter::NumberToString => DomainType::Int64,
            ValueConverter::UuidToString => DomainType::Uuid,
        }
    }

    /// Translate a domain value into its stored representation.
    pub fn to_provider(&self, value: &Value) -> Result<Value, Error> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (ValueConverter::BoolToString { false_value, true_value }, Value::Bool(b)) => {
                Ok(Value::String(if *b { true_value.clone() } else { false_value.clone() }))
            }
            (ValueConverter::BoolToZeroOne, Value::Bool(b)) => Ok(Value::Int32(i32::from(*b))),
            (ValueConverter::NumberToString, v) if v.as_i64().is_some() => {
                Ok(Value::String(v.as_i64().unwrap_or_default().to_string()))
            }
            (ValueConverter::UuidToString, Value::Uuid(u)) => Ok(Value::String(hex::encode(u))),
            (converter, v) => Err(converter.failure(v, "unexpected domain value")),
        }
    }

    /// Translate a stored value back into the domain representation.
    pub fn from_provider(&self, value: &Value) -> Result<Value, Error> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match (self, value) {
            (ValueConverter::BoolToString { false_value, true_value }, Value::String(s)) => {
                if s == true_value {
                    Ok(Value::Bool(true))
                } else if s == false_value {
                    Ok(Value::Bool(false))
                } else {
                    Err(self.failure(value, "not a recognised boolean literal"))
                }
            }
            (ValueConverter::BoolToZeroOne, v) => match v.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(self.failure(v, "expected 0 or 1")),
            },
            (ValueConverter::NumberToString, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(Value::Int64)
                .map_err(|e| self.failure(value, &e.to_string())),
            (ValueConverter::UuidToString, Value::String(s)) => {
                let bytes = hex::decode(s).map_err(|e| self.failure(value, &e.to_string()))?;
                let uuid: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| self.failure(value, "expected 16 bytes"))?;
                Ok(Value::Uuid(uuid))
            }
            (_, v) => Err(self.failure(v, "unexpected stored value")),
        }
    }

    fn failure(&self, value: &Value, reason: &str) -> Error {
        Error::Conversion {
            converter: self.name(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Maps a stored column type to its domain type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeMapping {
    /// Store type name, e.g. `char(1)`.
    pub store_type: String,
    /// Domain type seen by the application.
    pub domain_type: DomainType,
    /// Conversion applied between store and domain, if any.
    pub converter: Option<ValueConverter>,
}

impl TypeMapping {
    /// A mapping without conversion.
    pub fn new(store_type: impl Into<String>, domain_type: DomainType) -> Self {
        Self {
            store_type: store_type.into(),
            domain_type,
            converter: None,
        }
    }

    /// A mapping through a value converter. The domain type comes from the converter.
    pub fn converted(store_type: impl Into<String>, converter: ValueConverter) -> Self {
        Self {
            store_type: store_type.into(),
            domain_type: converter.model_type(),
            converter: Some(converter),
        }
    }

    pub fn has_converter(&self) -> bool {
        self.converter.is_some()
    }

    /// Boolean in the domain but stored through a converter.
    pub fn is_converted_bool(&self) -> bool {
        self.domain_type == DomainType::Bool && self.converter.is_some()
    }
}
