//! Wall-clock timestamps as written into run documents.

use chrono::{Local, NaiveDateTime, Timelike};

/// Format used for every timestamp persisted by the engine.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp type carried by records and manifests.
pub type Timestamp = NaiveDateTime;

/// Returns the current local time truncated to whole seconds.
#[must_use]
pub fn now_local() -> Timestamp {
    let now = Local::now().naive_local();
    // Persisted precision is one second.
    now.with_nanosecond(0).unwrap_or(now)
}

/// Formats a timestamp with [`DATETIME_FORMAT`].
#[must_use]
pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(DATETIME_FORMAT).to_string()
}

/// Parses a timestamp written with [`DATETIME_FORMAT`].
///
/// # Errors
///
/// Returns the chrono parse error if the input does not match the format.
pub fn parse_timestamp(input: &str) -> Result<Timestamp, chrono::ParseError> {
    NaiveDateTime::parse_from_str(input.trim(), DATETIME_FORMAT)
}

/// Serde adapter for `Option<Timestamp>` fields.
pub mod optional_timestamp {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as a formatted string or null.
    pub fn serialize<S>(value: &Option<Timestamp>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes from a formatted string or null.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            Some(s) if !s.trim().is_empty() => parse_timestamp(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// Serde adapter for required `Timestamp` fields.
pub mod required_timestamp {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as a formatted string.
    pub fn serialize<S>(value: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_timestamp(value))
    }

    /// Deserializes from a formatted string.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
