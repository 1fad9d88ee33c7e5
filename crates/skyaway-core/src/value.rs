//! Nullable value types shared by the store, config and JSON surfaces.
//!
//! Both wrappers map an absent value to SQL `NULL` and JSON `null`:
//!
//! | type        | SQLite            | JSON / TOML            |
//! |-------------|-------------------|------------------------|
//! | `Duration`  | INTEGER millis    | `"1h30m"`, `"250ms"`   |
//! | `Timestamp` | TEXT (RFC 3339)   | `"2026-01-01T00:00:00Z"` |

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

const MS_PER_SECOND: u128 = 1_000;
const MS_PER_MINUTE: u128 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: u128 = 60 * MS_PER_MINUTE;

/// A duration that may be absent, with millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Duration(Option<StdDuration>);

impl Duration {
    pub const NULL: Duration = Duration(None);

    pub fn new(duration: StdDuration) -> Self {
        Self(Some(duration))
    }

    pub fn from_secs(secs: u64) -> Self {
        Self::new(StdDuration::from_secs(secs))
    }

    pub fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub fn get(&self) -> Option<StdDuration> {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// The value as a chrono duration for timestamp arithmetic.
    pub fn to_chrono(&self) -> Option<chrono::Duration> {
        self.0.and_then(|d| chrono::Duration::from_std(d).ok())
    }
}

impl From<StdDuration> for Duration {
    fn from(duration: StdDuration) -> Self {
        Self::new(duration)
    }
}

impl From<Option<StdDuration>> for Duration {
    fn from(duration: Option<StdDuration>) -> Self {
        Self(duration)
    }
}

/// Canonical form: non-zero `h`, `m`, `s`, `ms` components in that order,
/// `0s` for zero and `null` when absent.
impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(duration) = self.0 else {
            return f.write_str("null");
        };
        let mut ms = duration.as_millis();
        if ms == 0 {
            return f.write_str("0s");
        }
        for (unit, size) in [
            ("h", MS_PER_HOUR),
            ("m", MS_PER_MINUTE),
            ("s", MS_PER_SECOND),
            ("ms", 1),
        ] {
            let count = ms / size;
            if count > 0 {
                write!(f, "{count}{unit}")?;
                ms %= size;
            }
        }
        Ok(())
    }
}

/// Accepts compound unit strings (`1h30m`, `90m`, `1.5h`, `250ms`) and bare
/// decimal numbers, which are read as hours.
impl FromStr for Duration {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let invalid = |message: &str| ValidationError::InvalidValue {
            field: "duration".to_string(),
            message: format!("{message}: '{s}'"),
        };

        if input.is_empty() {
            return Err(invalid("empty duration"));
        }

        if let Ok(hours) = input.parse::<f64>() {
            if !hours.is_finite() || hours < 0.0 {
                return Err(invalid("duration must be a non-negative number"));
            }
            let ms = (hours * MS_PER_HOUR as f64).round() as u64;
            return Ok(Duration::new(StdDuration::from_millis(ms)));
        }

        let mut total_ms = 0f64;
        let mut rest = input;
        while !rest.is_empty() {
            let number_len = rest
                .find(|c: char| !(c.is_ascii_digit() || c == '.'))
                .unwrap_or(rest.len());
            if number_len == 0 {
                return Err(invalid("expected a number"));
            }
            let value: f64 = rest[..number_len]
                .parse()
                .map_err(|_| invalid("malformed number"))?;
            rest = &rest[number_len..];

            let unit_len = rest
                .find(|c: char| c.is_ascii_digit() || c == '.')
                .unwrap_or(rest.len());
            let size = match &rest[..unit_len] {
                "h" => MS_PER_HOUR,
                "m" => MS_PER_MINUTE,
                "s" => MS_PER_SECOND,
                "ms" => 1,
                "" => return Err(invalid("missing unit")),
                _ => return Err(invalid("unknown unit")),
            };
            rest = &rest[unit_len..];
            total_ms += value * size as f64;
        }

        Ok(Duration::new(StdDuration::from_millis(total_ms.round() as u64)))
    }
}

impl Serialize for Duration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(_) => serializer.serialize_str(&self.to_string()),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Duration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) => s.parse().map_err(serde::de::Error::custom),
            None => Ok(Duration::NULL),
        }
    }
}

impl ToSql for Duration {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self.0 {
            Some(duration) => {
                let ms = i64::try_from(duration.as_millis())
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                Ok(ToSqlOutput::Owned(Value::Integer(ms)))
            }
            None => Ok(ToSqlOutput::Owned(Value::Null)),
        }
    }
}

impl FromSql for Duration {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Duration::NULL),
            ValueRef::Integer(ms) => u64::try_from(ms)
                .map(|ms| Duration::new(StdDuration::from_millis(ms)))
                .map_err(|_| FromSqlError::OutOfRange(ms)),
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

/// A UTC timestamp that may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Option<DateTime<Utc>>);

impl Timestamp {
    pub const NULL: Timestamp = Timestamp(None);

    pub fn at(time: DateTime<Utc>) -> Self {
        Self(Some(time))
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(time: DateTime<Utc>) -> Self {
        Self::at(time)
    }
}

impl From<Option<DateTime<Utc>>> for Timestamp {
    fn from(time: Option<DateTime<Utc>>) -> Self {
        Self(time)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            Some(time) => time.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<DateTime<Utc>>::deserialize(deserializer).map(Timestamp)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match &self.0 {
            Some(time) => Ok(ToSqlOutput::Owned(Value::Text(time.to_rfc3339()))),
            None => Ok(ToSqlOutput::Owned(Value::Null)),
        }
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Timestamp::NULL),
            ValueRef::Text(_) => {
                let text = value.as_str()?;
                DateTime::parse_from_rfc3339(text)
                    .map(|time| Timestamp::at(time.with_timezone(&Utc)))
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}
