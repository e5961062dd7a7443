//! Go-style duration strings ("90s", "2m30s", "1h", "300ms")
//!
//! Used by the CLI flags and by the unhealthy-conditions ConfigMap.

use std::time::Duration;

use crate::error::{Error, Result};

/// Parse a duration such as `5m`, `1h30m`, `1.5s` or `250ms`.
///
/// A bare `0` is accepted. Negative durations are rejected.
pub fn parse(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::ConfigError("empty duration".to_string()));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(Error::ConfigError(format!("negative duration {input:?}")));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| Error::ConfigError(format!("missing unit in duration {input:?}")))?;
        if num_len == 0 {
            return Err(Error::ConfigError(format!("invalid duration {input:?}")));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| Error::ConfigError(format!("invalid duration {input:?}")))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            unit => {
                return Err(Error::ConfigError(format!(
                    "unknown unit {unit:?} in duration {input:?}"
                )))
            }
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Ok(Duration::from_secs_f64(total))
}

/// Render a duration the way Go prints it, e.g. `5m0s`, `1h2m3s`, `250ms`.
pub fn format(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }
    if d < Duration::from_secs(1) {
        let nanos = d.as_nanos();
        return if nanos % 1_000_000 == 0 {
            format!("{}ms", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{}µs", nanos / 1_000)
        } else {
            format!("{nanos}ns")
        };
    }

    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    let frac = d.subsec_millis();
    let secs = if frac > 0 {
        format!("{secs}.{}", format!("{frac:03}").trim_end_matches('0'))
    } else {
        secs.to_string()
    };

    if hours > 0 {
        format!("{hours}h{minutes}m{secs}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Serde adapter for Go-style duration fields.
pub mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(parse("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("2m30s").unwrap(), Duration::from_secs(150));
        assert_eq!(parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("").is_err());
        assert!(parse("10").is_err());
        assert!(parse("-5s").is_err());
        assert!(parse("5d").is_err());
        assert!(parse("s").is_err());
    }

    #[test]
    fn test_format() {
        assert_eq!(format(Duration::from_secs(300)), "5m0s");
        assert_eq!(format(Duration::from_secs(3723)), "1h2m3s");
        assert_eq!(format(Duration::from_secs(26)), "26s");
        assert_eq!(format(Duration::from_millis(250)), "250ms");
        assert_eq!(format(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format(Duration::ZERO), "0s");
    }
}
