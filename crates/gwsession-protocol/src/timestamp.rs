//! Lenient timestamp parsing for backend payloads.
//!
//! The backend reports expiries either as Unix seconds, Unix milliseconds,
//! or RFC 3339 strings depending on the endpoint. Everything is normalized
//! to Unix seconds.

use chrono::DateTime;
use serde::{Deserialize, Deserializer, Serializer};

use crate::ProtocolError;

/// Numbers above this are taken to be milliseconds (≈ year 5138 in seconds).
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Int(u64),
    Float(f64),
    Text(String),
}

/// Parses a timestamp string: digits (seconds or milliseconds) or RFC 3339.
pub fn parse_timestamp(text: &str) -> Result<u64, ProtocolError> {
    let text = text.trim();
    if let Ok(n) = text.parse::<u64>() {
        return Ok(normalize(n));
    }
    DateTime::parse_from_rfc3339(text)
        .map_err(|e| ProtocolError::InvalidTimestamp(format!("{text}: {e}")))
        .and_then(|dt| {
            u64::try_from(dt.timestamp())
                .map_err(|_| ProtocolError::InvalidTimestamp(format!("{text}: before 1970")))
        })
}

fn normalize(n: u64) -> u64 {
    if n > MILLIS_THRESHOLD { n / 1000 } else { n }
}

fn from_raw(raw: RawTimestamp) -> Result<u64, ProtocolError> {
    match raw {
        RawTimestamp::Int(n) => Ok(normalize(n)),
        RawTimestamp::Float(f) if f.is_finite() && f >= 0.0 => Ok(normalize(f as u64)),
        RawTimestamp::Float(f) => Err(ProtocolError::InvalidTimestamp(f.to_string())),
        RawTimestamp::Text(s) => parse_timestamp(&s),
    }
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawTimestamp::deserialize(deserializer)?;
    from_raw(raw).map_err(serde::de::Error::custom)
}

pub(crate) fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(*value)
}

pub(crate) mod option {
    use super::*;

    pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<RawTimestamp>::deserialize(deserializer)? {
            Some(raw) => from_raw(raw).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }

    pub(crate) fn serialize<S>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(v),
            None => serializer.serialize_none(),
        }
    }
}
