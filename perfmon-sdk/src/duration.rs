//! Parsing of human-written durations such as `"1 second"` or
//! `"500 ms, 2 minutes"`.

use std::time::Duration;

use crate::error::{PerfMonError, Result};

/// Unit suffix to milliseconds multiplier (longer suffixes first so that
/// `"ms"` is not read as `"s"`).
const UNITS: &[(&str, f64)] = &[
    ("milliseconds", 1.0),
    ("millisecond", 1.0),
    ("millis", 1.0),
    ("ms", 1.0),
    ("seconds", 1_000.0),
    ("second", 1_000.0),
    ("secs", 1_000.0),
    ("sec", 1_000.0),
    ("s", 1_000.0),
    ("minutes", 60_000.0),
    ("minute", 60_000.0),
    ("mins", 60_000.0),
    ("min", 60_000.0),
    ("m", 60_000.0),
    ("hours", 3_600_000.0),
    ("hour", 3_600_000.0),
    ("h", 3_600_000.0),
];

/// Parse a single duration. A bare number is read as milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let trimmed = s.trim();
    let invalid = || PerfMonError::InvalidDuration(s.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value: f64 = number.parse().map_err(|_| invalid())?;
    let unit = unit.trim().to_ascii_lowercase();

    let multiplier = if unit.is_empty() {
        1.0
    } else {
        UNITS
            .iter()
            .find(|(suffix, _)| *suffix == unit)
            .map(|(_, m)| *m)
            .ok_or_else(invalid)?
    };

    let millis = value * multiplier;
    if !millis.is_finite() || millis < 0.0 {
        return Err(invalid());
    }
    Ok(Duration::from_micros((millis * 1_000.0).round() as u64))
}

/// Parse a comma separated list of durations, e.g. `"1 second, 2 seconds"`.
///
/// The result is sorted ascending with duplicates removed.
pub fn parse_duration_list(s: &str) -> Result<Vec<Duration>> {
    let mut list = s
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(parse_duration)
        .collect::<Result<Vec<_>>>()?;
    if list.is_empty() {
        return Err(PerfMonError::InvalidDuration(s.to_string()));
    }
    list.sort();
    list.dedup();
    Ok(list)
}

/// Serde adapter for duration fields written as strings or bare
/// millisecond numbers.
pub(crate) mod serde_duration {
    use std::time::Duration;

    use serde::de::{self, Deserializer, Visitor};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a duration such as \"1 minute\" or a number of milliseconds")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_millis(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_millis)
                    .map_err(|_| E::custom("negative duration"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                super::parse_duration(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
