//! Normalization of the timestamp shapes clients send.
//!
//! Documents written by older clients carry dates as the provider-native
//! `{_seconds, _nanoseconds}` wrapper, as a plain `{seconds, nanoseconds}`
//! pair, as an ISO string, or as epoch milliseconds. Everything is turned
//! into a `DateTime<Utc>` before any date arithmetic happens.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Native {
        #[serde(rename = "_seconds")]
        seconds: i64,
        #[serde(rename = "_nanoseconds", default)]
        nanoseconds: u32,
    },
    Pair {
        seconds: i64,
        #[serde(default)]
        nanoseconds: u32,
    },
    Millis(f64),
    Text(String),
}

impl RawTimestamp {
    pub fn normalize(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Native {
                seconds,
                nanoseconds,
            }
            | RawTimestamp::Pair {
                seconds,
                nanoseconds,
            } => Utc.timestamp_opt(*seconds, *nanoseconds).single(),
            RawTimestamp::Millis(ms) if ms.is_finite() => {
                DateTime::from_timestamp_millis(ms.trunc() as i64)
            }
            RawTimestamp::Millis(_) => None,
            RawTimestamp::Text(s) => parse_text(s),
        }
    }
}

fn parse_text(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ms) = s.parse::<i64>() {
        return DateTime::from_timestamp_millis(ms);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// `deserialize_with` helper for a required timestamp field.
pub fn flexible<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = RawTimestamp::deserialize(deserializer)?;
    raw.normalize()
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp: {:?}", raw)))
}
