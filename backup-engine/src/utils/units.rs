//! Parsers for human-friendly size, duration and point-in-time values.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::errors::{EngineError, Result};

/// Parse a size like "5mb", "512 KB", "1g" or a bare number in `default_unit`.
/// Units are binary (1kb = 1024 bytes).
pub fn parse_size(s: &str, default_unit: &str) -> Result<u64> {
    let s = s.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(EngineError::Config("empty size string".into()));
    }

    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num_str, unit) = s.split_at(split);
    let n: u64 = num_str
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid size: '{s}'")))?;

    let unit = match unit.trim() {
        "" => default_unit.to_ascii_lowercase(),
        other => other.to_string(),
    };
    let multiplier: u64 = match unit.as_str() {
        "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        "t" | "tb" => 1024 * 1024 * 1024 * 1024,
        _ => return Err(EngineError::Config(format!("unknown size unit: '{unit}'"))),
    };

    n.checked_mul(multiplier)
        .ok_or_else(|| EngineError::Config(format!("size out of range: '{s}'")))
}

/// Parse a duration string like "2d", "48h", "1w", "6m", "1y" or a compound
/// such as "1w3d". Pure numeric values are treated as days.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::Config("empty duration string".into()));
    }

    if let Ok(n) = s.parse::<i64>() {
        return Ok(Duration::days(n));
    }

    let mut total = Duration::zero();
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return Err(EngineError::Config(format!("invalid duration: '{s}'")));
        }
        let n: i64 = rest[..digits]
            .parse()
            .map_err(|_| EngineError::Config(format!("invalid duration number in '{s}'")))?;
        let mut chars = rest[digits..].chars();
        let suffix = chars
            .next()
            .ok_or_else(|| EngineError::Config(format!("missing duration suffix in '{s}'")))?;

        total = total
            + match suffix {
                's' | 'S' => Duration::seconds(n),
                'h' | 'H' => Duration::hours(n),
                'd' | 'D' => Duration::days(n),
                'w' | 'W' => Duration::weeks(n),
                'm' | 'M' => Duration::days(n * 30),
                'y' | 'Y' => Duration::days(n * 365),
                _ => {
                    return Err(EngineError::Config(format!(
                        "unknown duration suffix: '{suffix}'"
                    )))
                }
            };
        rest = chars.as_str();
    }

    Ok(total)
}

/// Parse a point in time: "now", an RFC 3339 timestamp, a plain date
/// (midnight UTC) or a duration meaning "that long before `now`".
pub fn parse_point_in_time(s: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() || s.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    parse_duration(s)
        .map(|d| now - d)
        .map_err(|_| EngineError::Config(format!("invalid point in time: '{s}'")))
}
