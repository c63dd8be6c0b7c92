//! Serde support for human-friendly duration strings.
//!
//! Configuration documents write durations as `"500ms"`, `"30s"`, `"5m"` or
//! `"1h"`. The serializer always emits whole seconds; the deserializer also
//! accepts the struct form `{ "secs": .., "nanos": .. }` for round-tripping
//! values produced by other tools.

use serde::{Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}s", duration.as_secs()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde::Deserialize;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Secs(u64),
        Parts { secs: u64, nanos: Option<u32> },
    }

    match Repr::deserialize(deserializer)? {
        Repr::Text(s) => parse_duration(&s).map_err(Error::custom),
        Repr::Secs(secs) => Ok(Duration::from_secs(secs)),
        Repr::Parts { secs, nanos } => Ok(Duration::new(secs, nanos.unwrap_or(0))),
    }
}

/// Parse a duration string with an `ms`, `s`, `m` or `h` suffix.
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Some(stripped) = s.strip_suffix("ms") {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_millis(num));
    }
    if let Some(stripped) = s.strip_suffix('h') {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 3600));
    }
    if let Some(stripped) = s.strip_suffix('m') {
        let num: u64 = stripped
            .trim()
            .parse()
            .map_err(|_| format!("invalid number: {stripped}"))?;
        return Ok(Duration::from_secs(num * 60));
    }
    let stripped = s.strip_suffix('s').unwrap_or(s);
    let num: f64 = stripped
        .trim()
        .parse()
        .map_err(|_| format!("unknown duration format: {s}"))?;
    if num < 0.0 {
        return Err(format!("negative duration: {s}"));
    }
    let secs = num.trunc() as u64;
    let nanos = (num.fract() * 1_000_000_000.0).round() as u32;
    Ok(Duration::new(secs, nanos))
}

/// Serde support for optional duration fields.
pub mod option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => super::serialize(d, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let value: Option<String> = Option::deserialize(deserializer)?;
        value
            .map(|s| super::parse_duration(&s).map_err(Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn parses_bare_and_fractional_seconds() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-3s").is_err());
    }
}
