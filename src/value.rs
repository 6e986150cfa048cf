//! Scalar value variant and its conversions (component C4).
//!
//! Every column in a row is one of six tags. Conversions between the tags
//! and host-language scalar types are total in one direction (encoding) and
//! fallible in the other (decoding, since e.g. `Text("abc")` cannot become
//! an `i64`).

use std::cmp::Ordering;

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// A tagged scalar value, mirroring what the embedded SQL engine can store
/// in a single column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    UInt64(u64),
    Int64(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Tag rank used to order values across mismatched tags when no
    /// meaningful coercion exists (see [`Value::cmp`]).
    fn tag_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::UInt64(_) => 1,
            Value::Int64(_) => 2,
            Value::Double(_) => 3,
            Value::Text(_) => 4,
            Value::Blob(_) => 5,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    // ---- encoding (host type -> Value) --------------------------------

    pub fn from_bool(v: bool) -> Value {
        Value::Int64(if v { 1 } else { 0 })
    }

    pub fn from_date(v: DateTime<Utc>) -> Value {
        let secs = v.timestamp() as f64 + v.timestamp_subsec_nanos() as f64 / 1_000_000_000.0;
        Value::Double(secs)
    }

    pub fn from_url(v: &url::Url) -> Value {
        Value::Text(v.as_str().to_string())
    }

    // ---- decoding (Value -> host type) ---------------------------------

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::UInt64(n) => Ok(*n),
            Value::Int64(n) => u64::try_from(*n)
                .map_err(|_| Error::BadResult(format!("int64 {n} does not fit in u64"))),
            Value::Double(f) if f.fract() == 0.0 && *f >= 0.0 => Ok(*f as u64),
            Value::Text(s) => s
                .parse()
                .map_err(|_| Error::BadResult(format!("cannot parse '{s}' as u64"))),
            other => Err(Error::BadResult(format!("cannot convert {other:?} to u64"))),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int64(n) => Ok(*n),
            Value::UInt64(n) => i64::try_from(*n)
                .map_err(|_| Error::BadResult(format!("uint64 {n} does not fit in i64"))),
            Value::Double(f) if f.fract() == 0.0 => Ok(*f as i64),
            Value::Text(s) => s
                .parse()
                .map_err(|_| Error::BadResult(format!("cannot parse '{s}' as i64"))),
            other => Err(Error::BadResult(format!("cannot convert {other:?} to i64"))),
        }
    }

    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Double(f) => Ok(*f),
            Value::Int64(n) => Ok(*n as f64),
            Value::UInt64(n) => Ok(*n as f64),
            Value::Text(s) => s
                .parse()
                .map_err(|_| Error::BadResult(format!("cannot parse '{s}' as f64"))),
            other => Err(Error::BadResult(format!("cannot convert {other:?} to f64"))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        Ok(self.as_i64()? != 0)
    }

    pub fn as_text(&self) -> Result<String> {
        match self {
            Value::Text(s) => Ok(s.clone()),
            Value::Blob(b) => String::from_utf8(b.clone())
                .map_err(|_| Error::BadResult("blob is not valid utf8".into())),
            Value::Int64(n) => Ok(n.to_string()),
            Value::UInt64(n) => Ok(n.to_string()),
            Value::Double(f) => Ok(f.to_string()),
            Value::Null => Err(Error::BadResult("cannot convert NULL to text".into())),
        }
    }

    pub fn as_blob(&self) -> Result<Vec<u8>> {
        match self {
            Value::Blob(b) => Ok(b.clone()),
            Value::Text(s) => Ok(s.as_bytes().to_vec()),
            other => Err(Error::BadResult(format!("cannot convert {other:?} to blob"))),
        }
    }

    pub fn as_date(&self) -> Result<DateTime<Utc>> {
        let secs = self.as_f64()?;
        let whole = secs.trunc() as i64;
        let nanos = ((secs.fract()) * 1_000_000_000.0).round() as u32;
        Utc.timestamp_opt(whole, nanos)
            .single()
            .ok_or_else(|| Error::BadResult(format!("{secs} is not a valid timestamp")))
    }

    pub fn as_url(&self) -> Result<url::Url> {
        let text = self.as_text()?;
        url::Url::parse(&text).map_err(|e| Error::BadResult(format!("invalid url '{text}': {e}")))
    }

    /// Render this value as a SQL literal, for the rare callers that build
    /// raw SQL text (e.g. the migration planner's data-copy statements).
    /// Bound-parameter paths never need this — they pass `Value` directly
    /// to `rusqlite`.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::UInt64(n) => n.to_string(),
            Value::Int64(n) => n.to_string(),
            Value::Double(f) => format!("{f:?}"),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Blob(b) => {
                let mut hex = String::with_capacity(b.len() * 2 + 2);
                hex.push_str("X'");
                for byte in b {
                    hex.push_str(&format!("{byte:02X}"));
                }
                hex.push('\'');
                hex
            }
        }
    }
}

/// Classify a host type into its canonical [`Value`] tag.
///
/// Unsigned integer types always route through [`Value::UInt64`], never
/// `Int64`, so that a `u64` with its high bit set round-trips without sign
/// corruption.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

macro_rules! impl_to_value_uint {
    ($($t:ty),*) => {
        $(impl ToValue for $t {
            fn to_value(&self) -> Value { Value::UInt64(*self as u64) }
        })*
    };
}

macro_rules! impl_to_value_int {
    ($($t:ty),*) => {
        $(impl ToValue for $t {
            fn to_value(&self) -> Value { Value::Int64(*self as i64) }
        })*
    };
}

impl_to_value_uint!(u8, u16, u32, u64);
impl_to_value_int!(i8, i16, i32, i64);

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::from_bool(*self)
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Value {
        Value::Double(*self as f64)
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Double(*self)
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Blob(self.clone())
    }
}

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::from_date(*self)
    }
}

impl ToValue for url::Url {
    fn to_value(&self) -> Value {
        Value::from_url(self)
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

/// Free-function form of [`ToValue::to_value`], matching the spec's
/// `from_any(v)` naming.
pub fn from_any<T: ToValue>(v: &T) -> Value {
    v.to_value()
}

/// Coerce `other` into the tag of `target`, for cross-tag comparisons.
/// Returns `None` when no meaningful coercion exists (e.g. `Blob` that
/// isn't valid utf8 compared against `Text`).
fn coerce_to_tag(other: &Value, target: &Value) -> Option<Value> {
    match target {
        Value::Null => Some(Value::Null),
        Value::UInt64(_) => other.as_u64().ok().map(Value::UInt64),
        Value::Int64(_) => other.as_i64().ok().map(Value::Int64),
        Value::Double(_) => other.as_f64().ok().map(Value::Double),
        Value::Text(_) => other.as_text().ok().map(Value::Text),
        Value::Blob(_) => other.as_blob().ok().map(Value::Blob),
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Value {}

impl Ord for Value {
    /// Same-tag values compare directly. Cross-tag values are compared by
    /// coercing the right-hand side into the left-hand side's tag; if that
    /// coercion fails, values fall back to an order-by-tag-rank so `cmp`
    /// stays total.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::UInt64(a), Value::UInt64(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => match coerce_to_tag(other, self) {
                Some(coerced) if coerced.tag_rank() == self.tag_rank() => {
                    // Recurse once, now same-tag.
                    self.cmp(&coerced)
                }
                _ => self.tag_rank().cmp(&other.tag_rank()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uint64_round_trips_high_bit() {
        let v = from_any(&u64::MAX);
        assert_eq!(v, Value::UInt64(u64::MAX));
        assert_eq!(v.as_u64().unwrap(), u64::MAX);
    }

    #[test]
    fn signed_and_unsigned_tags_are_distinct() {
        assert_eq!(from_any(&5u32), Value::UInt64(5));
        assert_eq!(from_any(&5i32), Value::Int64(5));
    }

    #[test]
    fn literal_rendering() {
        assert_eq!(Value::Null.to_sql_literal(), "NULL");
        assert_eq!(Value::Text("a'b".into()).to_sql_literal(), "'a''b'");
        assert_eq!(Value::Blob(vec![0xde, 0xad]).to_sql_literal(), "X'DEAD'");
    }

    #[test]
    fn date_round_trip_to_microsecond() {
        let now = Utc::now();
        let v = from_any(&now);
        let back = v.as_date().unwrap();
        let diff = (now - back).num_microseconds().unwrap_or(i64::MAX).abs();
        assert!(diff <= 1, "expected microsecond-level precision, diff={diff}");
    }

    #[test]
    fn cross_tag_ordering_falls_back_to_conversion() {
        let a = Value::Int64(5);
        let b = Value::Text("5".to_string());
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn bool_round_trip() {
        assert_eq!(from_any(&true), Value::Int64(1));
        assert!(Value::Int64(2).as_bool().unwrap());
        assert!(!Value::Int64(0).as_bool().unwrap());
    }
}
