//! Shared utility functions used across the crate.

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "500ms", "1m30s", "4h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "5m")
/// - `Nh` - hours (e.g., "4h")
/// - Compound, largest unit first (e.g., "1m30s", "1h5m", "2s250ms")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// Returns `None` if the string cannot be parsed, is negative, or does not
/// fit in a `Duration`.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s.bytes().all(|b| b.is_ascii_digit()) {
        // Bare numbers are milliseconds
        return s.parse::<u64>().ok().map(Duration::from_millis);
    }

    let mut total = Duration::ZERO;
    let mut previous_rank = usize::MAX;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);
        let letters = tail
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(letters);

        let (rank, unit_millis) = match unit {
            "h" => (3, 3_600_000u64),
            "m" => (2, 60_000),
            "s" => (1, 1_000),
            "ms" => (0, 1),
            _ => return None,
        };
        // Each unit at most once, largest first
        if number.is_empty() || rank >= previous_rank {
            return None;
        }
        previous_rank = rank;

        let part = match number.parse::<u64>() {
            Ok(whole) => Duration::from_millis(whole.checked_mul(unit_millis)?),
            Err(_) => {
                let value = number.parse::<f64>().ok()?;
                Duration::try_from_secs_f64(value * unit_millis as f64 / 1000.0).ok()?
            }
        };
        total = total.checked_add(part)?;
        rest = tail;
    }
    Some(total)
}

/// Render a duration compactly for console output ("1h5m", "2m30s", "1.25s", "80ms").
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else if secs >= 1 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}
