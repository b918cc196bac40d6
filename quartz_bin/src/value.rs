//! Runtime values: literal coercion, fixed-width encoding and the
//! textual forms used in result tables.

use chrono::NaiveDateTime;
use strata::types::ColType;

use crate::catalog::ColMeta;
use crate::errors::{QueryError, QueryResult};

/// Width of the canonical `YYYY-MM-DD HH:MM:SS` form.
pub const DATETIME_LEN: usize = 19;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    BigInt(i64),
    Float(f32),
    Str(String),
    Datetime(String),
}

impl Value {
    pub fn col_type(&self) -> ColType {
        match self {
            Value::Int(_) => ColType::Int,
            Value::BigInt(_) => ColType::BigInt,
            Value::Float(_) => ColType::Float,
            Value::Str(_) => ColType::String,
            Value::Datetime(_) => ColType::Datetime,
        }
    }

    /// Validates and canonicalizes a datetime literal.
    pub fn datetime(text: &str) -> QueryResult<Value> {
        let parsed = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
            .map_err(|_| QueryError::InvalidDatetime(text.to_string()))?;
        Ok(Value::Datetime(
            parsed.format("%Y-%m-%d %H:%M:%S").to_string(),
        ))
    }

    /// Coerces a literal to a column's type, applying the permitted
    /// widenings: int→bigint, int→float, datetime↔char text.
    pub fn coerce_to(self, col: &ColMeta) -> QueryResult<Value> {
        match (col.col_type, self) {
            (ColType::Int, Value::Int(v)) => Ok(Value::Int(v)),
            (ColType::BigInt, Value::Int(v)) => Ok(Value::BigInt(v as i64)),
            (ColType::BigInt, Value::BigInt(v)) => Ok(Value::BigInt(v)),
            (ColType::Float, Value::Int(v)) => Ok(Value::Float(v as f32)),
            (ColType::Float, Value::Float(v)) => Ok(Value::Float(v)),
            (ColType::String, Value::Str(s)) => {
                if s.len() > col.len {
                    return Err(QueryError::StringOverflow);
                }
                Ok(Value::Str(s))
            }
            // A datetime literal lands in a CHAR column as its text.
            (ColType::String, Value::Datetime(s)) => {
                if s.len() > col.len {
                    return Err(QueryError::StringOverflow);
                }
                Ok(Value::Str(s))
            }
            (ColType::Datetime, Value::Datetime(s)) => Ok(Value::Datetime(s)),
            (ColType::Datetime, Value::Str(s)) => Value::datetime(&s),
            (expected, found) => Err(QueryError::IncompatibleType {
                expected: expected.name().to_string(),
                found: found.col_type().name().to_string(),
            }),
        }
    }

    /// Encodes at the column's fixed width (strings are NUL padded).
    pub fn to_bytes(&self, len: usize) -> QueryResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self {
            Value::Int(v) => buf[..4].copy_from_slice(&v.to_ne_bytes()),
            Value::BigInt(v) => buf[..8].copy_from_slice(&v.to_ne_bytes()),
            Value::Float(v) => buf[..4].copy_from_slice(&v.to_ne_bytes()),
            Value::Str(s) | Value::Datetime(s) => {
                if s.len() > len {
                    return Err(QueryError::StringOverflow);
                }
                buf[..s.len()].copy_from_slice(s.as_bytes());
            }
        }
        Ok(buf)
    }

    pub fn from_bytes(ty: ColType, bytes: &[u8]) -> Value {
        match ty {
            ColType::Int => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[..4]);
                Value::Int(i32::from_ne_bytes(b))
            }
            ColType::BigInt => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[..8]);
                Value::BigInt(i64::from_ne_bytes(b))
            }
            ColType::Float => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[..4]);
                Value::Float(f32::from_ne_bytes(b))
            }
            ColType::String | ColType::Datetime => {
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                let text = String::from_utf8_lossy(&bytes[..end]).into_owned();
                if ty == ColType::String {
                    Value::Str(text)
                } else {
                    Value::Datetime(text)
                }
            }
        }
    }

    /// The textual form used in result tables.
    pub fn to_display(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::BigInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Str(s) | Value::Datetime(s) => s.clone(),
        }
    }
}

/// Compares two runtime values, widening across the numeric types the
/// coercion rules allow to meet.
pub fn compare_values(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::BigInt(x), Value::BigInt(y)) => x.cmp(y),
        (Value::Int(x), Value::BigInt(y)) => (*x as i64).cmp(y),
        (Value::BigInt(x), Value::Int(y)) => x.cmp(&(*y as i64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Int(x), Value::Float(y)) => {
            (*x as f32).partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Value::Float(x), Value::Int(y)) => {
            x.partial_cmp(&(*y as f32)).unwrap_or(Ordering::Equal)
        }
        (Value::Str(x) | Value::Datetime(x), Value::Str(y) | Value::Datetime(y)) => x.cmp(y),
        // Remaining combinations cannot survive analysis; order them
        // stably by type tag.
        _ => a.col_type().name().cmp(b.col_type().name()),
    }
}

/// Decodes the display form of one column straight from a record.
pub fn column_display(col: &ColMeta, record: &[u8]) -> String {
    Value::from_bytes(col.col_type, &record[col.offset..col.offset + col.len]).to_display()
}

/// The smallest encoding of a column type, used to pad the low end of a
/// composite search key.
pub fn min_bytes(ty: ColType, len: usize) -> Vec<u8> {
    match ty {
        ColType::Int => i32::MIN.to_ne_bytes().to_vec(),
        ColType::BigInt => i64::MIN.to_ne_bytes().to_vec(),
        ColType::Float => f32::MIN.to_ne_bytes().to_vec(),
        ColType::String | ColType::Datetime => vec![0u8; len],
    }
}

/// The largest encoding of a column type, used to pad the high end of a
/// composite search key.
pub fn max_bytes(ty: ColType, len: usize) -> Vec<u8> {
    match ty {
        ColType::Int => i32::MAX.to_ne_bytes().to_vec(),
        ColType::BigInt => i64::MAX.to_ne_bytes().to_vec(),
        ColType::Float => f32::MAX.to_ne_bytes().to_vec(),
        ColType::String | ColType::Datetime => vec![0xFFu8; len],
    }
}
