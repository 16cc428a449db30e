//! SQL value types for database-agnostic data transfer.
//!
//! Readers produce `SqlValue`s in whatever shape the source driver hands
//! back; before a batch is written each value is coerced to the canonical
//! type of its destination column so every writer sees a predictable
//! representation.

use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::dialect::CanonicalType;

/// A single SQL value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    /// NULL.
    Null,

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    /// Text/string data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

/// Row of values in column order.
pub type Row = Vec<SqlValue>;

impl SqlValue {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, if it is integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(v) => Some(*v as i64),
            SqlValue::I32(v) => Some(*v as i64),
            SqlValue::I64(v) => Some(*v),
            SqlValue::Bool(b) => Some(*b as i64),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::I16(v) => Some(Decimal::from(*v)),
            SqlValue::I32(v) => Some(Decimal::from(*v)),
            SqlValue::I64(v) => Some(Decimal::from(*v)),
            SqlValue::Bool(b) => Some(Decimal::from(*b as i32)),
            SqlValue::F32(f) => Decimal::from_f32(*f),
            SqlValue::F64(f) => Decimal::from_f64(*f),
            SqlValue::Decimal(d) => Some(*d),
            SqlValue::Text(s) => Decimal::from_str(s.trim())
                .or_else(|_| Decimal::from_scientific(s.trim()))
                .ok(),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::F32(f) => Some(*f as f64),
            SqlValue::F64(f) => Some(*f),
            SqlValue::Decimal(d) => d.to_f64(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    /// Render as text, the lossless fallback for string destinations.
    pub fn to_text(&self) -> Option<String> {
        Some(match self {
            SqlValue::Null => return None,
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::I16(v) => v.to_string(),
            SqlValue::I32(v) => v.to_string(),
            SqlValue::I64(v) => v.to_string(),
            SqlValue::F32(v) => v.to_string(),
            SqlValue::F64(v) => v.to_string(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bytes(b) => String::from_utf8(b.clone()).ok()?,
            SqlValue::Uuid(u) => u.to_string(),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            SqlValue::DateTimeOffset(dt) => dt.to_rfc3339(),
            SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
            SqlValue::Time(t) => t.format("%H:%M:%S%.f").to_string(),
        })
    }

    /// Convert into the representation a column of `target` type expects.
    ///
    /// Returns `Err` with a reason when the value cannot be represented
    /// without loss (out-of-range integers, over-long strings, unparsable
    /// text). Callers surface this as a non-transient write failure.
    pub fn coerce(self, target: &CanonicalType) -> Result<SqlValue, String> {
        match (self, target) {
            (SqlValue::Null, _) => Ok(SqlValue::Null),
            (
                SqlValue::Bytes(b),
                CanonicalType::Binary | CanonicalType::Text | CanonicalType::Unknown(_),
            ) => Ok(SqlValue::Bytes(b)),
            (SqlValue::Text(s), CanonicalType::Binary) => Ok(SqlValue::Bytes(s.into_bytes())),
            (SqlValue::Text(s), CanonicalType::Text | CanonicalType::Unknown(_)) => {
                Ok(SqlValue::Text(s))
            }
            (SqlValue::Text(s), CanonicalType::FixedString(n) | CanonicalType::VariableString(n))
                if s.chars().count() <= *n as usize =>
            {
                Ok(SqlValue::Text(s))
            }
            (value, target) => value
                .convert(target)
                .map_err(|why| format!("cannot store {:?} as {}: {}", value, target, why)),
        }
    }

    fn convert(&self, target: &CanonicalType) -> Result<SqlValue, String> {
        let fail = |why: &str| why.to_string();

        match target {
            CanonicalType::Integer => {
                let v = self.as_i64().ok_or_else(|| fail("not an integer"))?;
                i32::try_from(v)
                    .map(SqlValue::I32)
                    .map_err(|_| fail("out of 32-bit range"))
            }
            CanonicalType::BigInteger => self
                .as_i64()
                .map(SqlValue::I64)
                .ok_or_else(|| fail("not an integer")),
            CanonicalType::Decimal { precision, scale } => {
                let d = self.as_decimal().ok_or_else(|| fail("not numeric"))?;
                let rounded = d.round_dp(*scale as u32);
                if rounded != d {
                    return Err(fail("scale would be truncated"));
                }
                let int_digits = integer_digits(&rounded);
                if int_digits > precision.saturating_sub(*scale) as u32 {
                    return Err(fail("exceeds declared precision"));
                }
                Ok(SqlValue::Decimal(rounded))
            }
            CanonicalType::Float => self
                .as_f64()
                .map(SqlValue::F64)
                .ok_or_else(|| fail("not numeric")),
            CanonicalType::Boolean => match self {
                SqlValue::Bool(b) => Ok(SqlValue::Bool(*b)),
                SqlValue::Text(s) => match s.trim().to_lowercase().as_str() {
                    "true" | "t" | "yes" | "y" | "1" => Ok(SqlValue::Bool(true)),
                    "false" | "f" | "no" | "n" | "0" => Ok(SqlValue::Bool(false)),
                    _ => Err(fail("not a boolean")),
                },
                other => match other.as_i64() {
                    Some(0) => Ok(SqlValue::Bool(false)),
                    Some(1) => Ok(SqlValue::Bool(true)),
                    _ => Err(fail("not 0 or 1")),
                },
            },
            CanonicalType::FixedString(n) | CanonicalType::VariableString(n) => {
                let s = self.to_text().ok_or_else(|| fail("not valid text"))?;
                let len = s.chars().count();
                if len > *n as usize {
                    return Err(format!("{} characters exceed length {}", len, n));
                }
                Ok(SqlValue::Text(s))
            }
            CanonicalType::Text | CanonicalType::Unknown(_) => self
                .to_text()
                .map(SqlValue::Text)
                .ok_or_else(|| fail("not valid text")),
            CanonicalType::Binary => match self {
                SqlValue::Uuid(u) => Ok(SqlValue::Bytes(u.as_bytes().to_vec())),
                _ => Err(fail("not binary")),
            },
            CanonicalType::Date => match self {
                SqlValue::Date(d) => Ok(SqlValue::Date(*d)),
                SqlValue::DateTime(dt) if dt.time() == NaiveTime::MIN => {
                    Ok(SqlValue::Date(dt.date()))
                }
                SqlValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                    .map(SqlValue::Date)
                    .map_err(|_| fail("not a date")),
                _ => Err(fail("not a date")),
            },
            CanonicalType::Time => match self {
                SqlValue::Time(t) => Ok(SqlValue::Time(*t)),
                SqlValue::Text(s) => NaiveTime::from_str(s.trim())
                    .map(SqlValue::Time)
                    .map_err(|_| fail("not a time")),
                _ => Err(fail("not a time")),
            },
            CanonicalType::Timestamp => match self {
                SqlValue::DateTime(dt) => Ok(SqlValue::DateTime(*dt)),
                SqlValue::Date(d) => Ok(SqlValue::DateTime(d.and_time(NaiveTime::MIN))),
                SqlValue::DateTimeOffset(dt) => Ok(SqlValue::DateTime(dt.naive_utc())),
                SqlValue::Text(s) => parse_naive_datetime(s)
                    .map(SqlValue::DateTime)
                    .ok_or_else(|| fail("not a timestamp")),
                _ => Err(fail("not a timestamp")),
            },
            CanonicalType::TimestampTz => match self {
                SqlValue::DateTimeOffset(dt) => Ok(SqlValue::DateTimeOffset(*dt)),
                SqlValue::DateTime(dt) => Ok(SqlValue::DateTimeOffset(
                    DateTime::<Utc>::from_naive_utc_and_offset(*dt, Utc).fixed_offset(),
                )),
                SqlValue::Date(d) => Ok(SqlValue::DateTimeOffset(
                    DateTime::<Utc>::from_naive_utc_and_offset(d.and_time(NaiveTime::MIN), Utc)
                        .fixed_offset(),
                )),
                SqlValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(SqlValue::DateTimeOffset)
                    .map_err(|_| fail("not a timestamp with timezone")),
                _ => Err(fail("not a timestamp with timezone")),
            },
        }
    }
}

fn integer_digits(d: &Decimal) -> u32 {
    let trunc = d.trunc().abs();
    if trunc.is_zero() {
        0
    } else {
        trunc.to_string().len() as u32
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

// From implementations for common types
impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// A batch of rows streamed from a source.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Row data.
    pub rows: Vec<Row>,

    /// Whether this is the final batch of the stream.
    pub is_last: bool,
}

impl Batch {
    /// Create a new batch.
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            is_last: false,
        }
    }

    /// Mark this as the final batch.
    pub fn mark_final(mut self) -> Self {
        self.is_last = true;
        self
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_coerce_integers() {
        assert_eq!(
            SqlValue::I16(7).coerce(&CanonicalType::Integer),
            Ok(SqlValue::I32(7))
        );
        assert_eq!(
            SqlValue::I32(7).coerce(&CanonicalType::BigInteger),
            Ok(SqlValue::I64(7))
        );
        assert!(SqlValue::I64(i64::MAX)
            .coerce(&CanonicalType::Integer)
            .is_err());
        assert_eq!(
            SqlValue::Decimal(dec("42")).coerce(&CanonicalType::BigInteger),
            Ok(SqlValue::I64(42))
        );
    }

    #[test]
    fn test_coerce_decimal_precision() {
        let target = CanonicalType::Decimal {
            precision: 10,
            scale: 2,
        };
        assert_eq!(
            SqlValue::Text("123.45".into()).coerce(&target),
            Ok(SqlValue::Decimal(dec("123.45")))
        );
        assert_eq!(
            SqlValue::I32(5).coerce(&target),
            Ok(SqlValue::Decimal(dec("5")))
        );
        // Would drop a digit.
        assert!(SqlValue::Decimal(dec("1.234")).coerce(&target).is_err());
        // Nine integer digits do not fit DECIMAL(10,2).
        assert!(SqlValue::Decimal(dec("123456789")).coerce(&target).is_err());
    }

    #[test]
    fn test_coerce_boolean() {
        assert_eq!(
            SqlValue::I16(1).coerce(&CanonicalType::Boolean),
            Ok(SqlValue::Bool(true))
        );
        assert_eq!(
            SqlValue::Text("N".into()).coerce(&CanonicalType::Boolean),
            Ok(SqlValue::Bool(false))
        );
        assert!(SqlValue::I32(2).coerce(&CanonicalType::Boolean).is_err());
    }

    #[test]
    fn test_coerce_strings_never_truncate() {
        let v = SqlValue::Text("x".repeat(30));
        assert!(v.clone().coerce(&CanonicalType::VariableString(20)).is_err());
        assert_eq!(
            v.clone().coerce(&CanonicalType::VariableString(50)),
            Ok(v.clone())
        );
        assert_eq!(
            SqlValue::Uuid(Uuid::nil()).coerce(&CanonicalType::FixedString(36)),
            Ok(SqlValue::Text(Uuid::nil().to_string()))
        );
    }

    #[test]
    fn test_coerce_temporal() {
        let d = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let dt = d.and_hms_opt(12, 30, 0).unwrap();
        assert_eq!(
            SqlValue::Text("2024-02-29".into()).coerce(&CanonicalType::Date),
            Ok(SqlValue::Date(d))
        );
        assert_eq!(
            SqlValue::Date(d).coerce(&CanonicalType::Timestamp),
            Ok(SqlValue::DateTime(d.and_time(NaiveTime::MIN)))
        );
        let tz = SqlValue::DateTime(dt)
            .coerce(&CanonicalType::TimestampTz)
            .unwrap();
        match tz {
            SqlValue::DateTimeOffset(v) => assert_eq!(v.naive_utc(), dt),
            other => panic!("unexpected {:?}", other),
        }
        assert!(SqlValue::DateTime(dt).coerce(&CanonicalType::Date).is_err());
    }

    #[test]
    fn test_coerce_error_names_value_and_target() {
        let err = SqlValue::Text("12.345".into())
            .coerce(&CanonicalType::Decimal {
                precision: 10,
                scale: 2,
            })
            .unwrap_err();
        assert!(err.contains("Text(\"12.345\")"));
        assert!(err.contains("Decimal(10,2)"));
        assert!(err.ends_with("scale would be truncated"));

        let err = SqlValue::Text("abcdef".into())
            .coerce(&CanonicalType::FixedString(3))
            .unwrap_err();
        assert!(err.contains("6 characters exceed length 3"));
    }

    #[test]
    fn test_pass_through_keeps_payload() {
        let bytes = SqlValue::Bytes(vec![0, 159, 146, 150]);
        assert_eq!(bytes.clone().coerce(&CanonicalType::Binary), Ok(bytes));
        assert_eq!(
            SqlValue::Text("hi".into()).coerce(&CanonicalType::Binary),
            Ok(SqlValue::Bytes(b"hi".to_vec()))
        );
    }

    #[test]
    fn test_null_passes_through() {
        assert_eq!(
            SqlValue::Null.coerce(&CanonicalType::Integer),
            Ok(SqlValue::Null)
        );
        assert_eq!(SqlValue::from(None::<i32>), SqlValue::Null);
    }

    #[test]
    fn test_batch_operations() {
        let batch = Batch::new(vec![vec![SqlValue::I32(1)], vec![SqlValue::I32(2)]]);
        assert_eq!(batch.len(), 2);
        assert!(!batch.is_last);
        let batch = batch.mark_final();
        assert!(batch.is_last);
        assert!(Batch::default().is_empty());
    }
}
