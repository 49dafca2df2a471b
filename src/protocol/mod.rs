//! Controller protocol layer.
//!
//! Typed values, data-block addressing, the transport capability and the
//! byte codec that maps one onto the other.

mod codec;
mod memory;
mod s7;
mod transport;

pub use codec::*;
pub use memory::*;
pub use s7::*;
pub use transport::*;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Protocol error types.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("not connected")]
    NotConnected,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("type mismatch: tag is {expected}, value is {found}")]
    TypeMismatch { expected: TagType, found: &'static str },
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("controller rejected request: {0}")]
    Rejected(String),
    #[error("payload of {size} bytes exceeds the {limit} byte PDU capacity")]
    TooLarge { size: usize, limit: usize },
}

impl ProtocolError {
    /// Whether the error leaves the underlying connection unusable.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotConnected
                | ProtocolError::Timeout(_)
                | ProtocolError::Io(_)
                | ProtocolError::MalformedResponse(_)
        )
    }
}

/// Declared type of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagType {
    Bool,
    Int,
    Word,
    Real,
    String,
}

impl TagType {
    /// Fixed byte width, `None` for strings.
    pub fn width(self) -> Option<usize> {
        match self {
            TagType::Bool => Some(1),
            TagType::Int | TagType::Word => Some(2),
            TagType::Real => Some(4),
            TagType::String => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TagType::Bool => "Bool",
            TagType::Int => "Int",
            TagType::Word => "Word",
            TagType::Real => "Real",
            TagType::String => "String",
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TagType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" => Ok(TagType::Bool),
            "int" => Ok(TagType::Int),
            "word" => Ok(TagType::Word),
            "real" => Ok(TagType::Real),
            "string" => Ok(TagType::String),
            other => Err(ProtocolError::InvalidValue(format!("unknown tag type '{}'", other))),
        }
    }
}

/// A decoded controller value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i16),
    Word(u16),
    Real(f32),
    String(String),
}

impl Value {
    pub fn tag_type(&self) -> TagType {
        match self {
            Value::Bool(_) => TagType::Bool,
            Value::Int(_) => TagType::Int,
            Value::Word(_) => TagType::Word,
            Value::Real(_) => TagType::Real,
            Value::String(_) => TagType::String,
        }
    }

    /// Convert a JSON value supplied by a client into a value of the given type.
    ///
    /// Numbers out of range for the target type are rejected rather than wrapped.
    pub fn from_json(ty: TagType, json: &serde_json::Value) -> Result<Value, ProtocolError> {
        use serde_json::Value as Json;

        let invalid = || ProtocolError::InvalidValue(format!("{} is not a valid {}", json, ty));

        match ty {
            TagType::Bool => match json {
                Json::Bool(b) => Ok(Value::Bool(*b)),
                Json::Number(n) => match n.as_i64() {
                    Some(0) => Ok(Value::Bool(false)),
                    Some(1) => Ok(Value::Bool(true)),
                    _ => Err(invalid()),
                },
                Json::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "1" | "on" => Ok(Value::Bool(true)),
                    "false" | "0" | "off" => Ok(Value::Bool(false)),
                    _ => Err(invalid()),
                },
                _ => Err(invalid()),
            },
            TagType::Int => json_integer(json)
                .and_then(|v| i16::try_from(v).ok())
                .map(Value::Int)
                .ok_or_else(invalid),
            TagType::Word => json_integer(json)
                .and_then(|v| u16::try_from(v).ok())
                .map(Value::Word)
                .ok_or_else(invalid),
            TagType::Real => {
                let v = match json {
                    Json::Number(n) => n.as_f64(),
                    Json::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                }
                .ok_or_else(invalid)?;
                if !v.is_finite() || v.abs() > f32::MAX as f64 {
                    return Err(invalid());
                }
                Ok(Value::Real(v as f32))
            }
            TagType::String => match json {
                Json::String(s) => Ok(Value::String(s.clone())),
                _ => Err(invalid()),
            },
        }
    }
}

fn json_integer(json: &serde_json::Value) -> Option<i64> {
    match json {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Word(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::String(v) => f.write_str(v),
        }
    }
}

/// Highest byte an S7 any-pointer can reach; the pointer carries a 24-bit
/// bit address.
pub const MAX_BYTE_OFFSET: u32 = 0x1F_FFFF;

/// Reject a span of `len` bytes at `start` that runs past [`MAX_BYTE_OFFSET`].
pub fn check_span(db: u16, start: u32, len: usize) -> Result<(), ProtocolError> {
    let last = start as u64 + (len.max(1) as u64 - 1);
    if last > MAX_BYTE_OFFSET as u64 {
        return Err(ProtocolError::InvalidAddress(format!(
            "DB{}.DBB{} (+{} bytes) is beyond byte {}",
            db, start, len, MAX_BYTE_OFFSET
        )));
    }
    Ok(())
}

/// A location in a controller data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub db: u16,
    pub byte: u32,
    pub bit: Option<u8>,
}

impl Address {
    pub fn new(db: u16, byte: u32) -> Self {
        Self { db, byte, bit: None }
    }

    pub fn with_bit(db: u16, byte: u32, bit: u8) -> Self {
        Self {
            db,
            byte,
            bit: Some(bit),
        }
    }

    /// Parse the `DB<n>.DB<X|B|W|D><offset>[.<bit>]` notation.
    ///
    /// Returns the address together with the type the width letter implies
    /// (`X` → Bool, `B` → Bool byte, `W` → Word, `D` → Real).
    pub fn parse(s: &str) -> Result<(Address, TagType), ProtocolError> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"(?i)^\s*DB(\d{1,5})\.DB([XBWD])(\d{1,7})(?:\.(\d))?\s*$").unwrap()
        });

        let invalid = || ProtocolError::InvalidAddress(s.to_string());
        let caps = re.captures(s).ok_or_else(invalid)?;

        let db: u16 = caps[1].parse().map_err(|_| invalid())?;
        let byte: u32 = caps[3].parse().map_err(|_| invalid())?;
        let bit: Option<u8> = match caps.get(4) {
            Some(m) => Some(m.as_str().parse().map_err(|_| invalid())?),
            None => None,
        };

        let width = caps[2].to_ascii_uppercase();
        let parsed = match (width.as_str(), bit) {
            ("X", Some(b)) if b < 8 => (Address::with_bit(db, byte, b), TagType::Bool),
            ("X", _) => return Err(invalid()),
            (_, Some(_)) => return Err(invalid()),
            ("B", None) => (Address::new(db, byte), TagType::Bool),
            ("W", None) => (Address::new(db, byte), TagType::Word),
            ("D", None) => (Address::new(db, byte), TagType::Real),
            _ => return Err(invalid()),
        };
        check_span(db, byte, parsed.1.width().unwrap_or(1))?;
        Ok(parsed)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "DB{}.DBX{}.{}", self.db, self.byte, bit),
            None => write!(f, "DB{}.DBB{}", self.db, self.byte),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_address_notation() {
        let (addr, ty) = Address::parse("DB10.DBX4.3").unwrap();
        assert_eq!(addr, Address::with_bit(10, 4, 3));
        assert_eq!(ty, TagType::Bool);

        let (addr, ty) = Address::parse("db2.dbw12").unwrap();
        assert_eq!(addr, Address::new(2, 12));
        assert_eq!(ty, TagType::Word);

        let (_, ty) = Address::parse("DB1.DBD8").unwrap();
        assert_eq!(ty, TagType::Real);
    }

    #[test]
    fn test_parse_address_rejects_bad_bits() {
        assert!(Address::parse("DB10.DBX4").is_err());
        assert!(Address::parse("DB10.DBX4.8").is_err());
        assert!(Address::parse("DB10.DBW4.1").is_err());
        assert!(Address::parse("M10.0").is_err());
    }

    #[test]
    fn test_parse_address_rejects_unreachable_bytes() {
        assert!(Address::parse("DB10.DBX2097151.7").is_ok());
        assert!(Address::parse("DB10.DBW2097150").is_ok());
        assert!(matches!(
            Address::parse("DB10.DBW2097151"),
            Err(ProtocolError::InvalidAddress(_))
        ));
        assert!(Address::parse("DB10.DBW2097152").is_err());
        assert!(Address::parse("DB10.DBD9999999").is_err());

        assert!(check_span(1, MAX_BYTE_OFFSET, 1).is_ok());
        assert!(check_span(1, MAX_BYTE_OFFSET, 2).is_err());
        assert!(check_span(1, u32::MAX, 4).is_err());
    }

    #[test]
    fn test_value_from_json_ranges() {
        assert_eq!(Value::from_json(TagType::Int, &json!(-32768)).unwrap(), Value::Int(-32768));
        assert!(Value::from_json(TagType::Int, &json!(32768)).is_err());
        assert_eq!(Value::from_json(TagType::Word, &json!(65535)).unwrap(), Value::Word(65535));
        assert!(Value::from_json(TagType::Word, &json!(-1)).is_err());
        assert_eq!(Value::from_json(TagType::Bool, &json!(1)).unwrap(), Value::Bool(true));
        assert!(Value::from_json(TagType::Bool, &json!(2)).is_err());
        assert_eq!(Value::from_json(TagType::Real, &json!("1.5")).unwrap(), Value::Real(1.5));
        assert!(Value::from_json(TagType::String, &json!(5)).is_err());
    }

    #[test]
    fn test_tag_type_round_trips_through_str() {
        for ty in [TagType::Bool, TagType::Int, TagType::Word, TagType::Real, TagType::String] {
            assert_eq!(ty.as_str().parse::<TagType>().unwrap(), ty);
        }
    }
}
