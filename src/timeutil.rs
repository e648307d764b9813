//! Time and schedule utilities.
//!
//! Pure helpers for HH:MM ranges, block timestamps and duration strings,
//! plus the [`Clock`] seam the engine reads wall-clock time through.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, NaiveTime, TimeZone, Timelike};

use crate::types::ValidationError;

/// Layout of persisted block timestamps (`2024-05-06 17:00:00 +0200`).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z";

/// Layout of schedule times.
pub const HHMM_FORMAT: &str = "%H:%M";

// ============================================================================
// Clock
// ============================================================================

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current local time with its UTC offset.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// Clock backed by the system's local time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Clock that returns a settable instant. Used by tests.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<FixedOffset>>,
}

impl FixedClock {
    /// Creates a clock frozen at `now`.
    #[must_use]
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Creates a clock frozen at a timestamp in [`TIMESTAMP_FORMAT`].
    ///
    /// # Panics
    ///
    /// Panics if `timestamp` does not parse; intended for test fixtures.
    #[must_use]
    pub fn at(timestamp: &str) -> Self {
        Self::new(parse_timestamp(timestamp).expect("valid fixture timestamp"))
    }

    /// Moves the clock to `now`.
    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    /// Advances the clock by `by`.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Timestamps
// ============================================================================

/// Formats a block timestamp.
pub fn format_timestamp(at: &DateTime<FixedOffset>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parses a block timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<FixedOffset>, chrono::ParseError> {
    DateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT)
}

/// Returns the remaining time until `expiry`, zero if it has passed.
pub fn until(now: &DateTime<FixedOffset>, expiry: &DateTime<FixedOffset>) -> Duration {
    (*expiry - *now).to_std().unwrap_or(Duration::ZERO)
}

// ============================================================================
// HH:MM ranges
// ============================================================================

/// Validates and normalises a schedule time.
///
/// Accepts `HH:MM` or `HHMM`; returns the `HH:MM` form.
pub fn format_time(input: &str) -> Result<String, ValidationError> {
    let input = input.trim();
    let invalid = || ValidationError::InvalidTime(input.to_string());

    let bytes = input.as_bytes();
    let normalised = match bytes.len() {
        4 if bytes.iter().all(u8::is_ascii_digit) => {
            format!("{}:{}", &input[..2], &input[2..])
        }
        5 if bytes[2] == b':'
            && [0, 1, 3, 4].iter().all(|&i| bytes[i].is_ascii_digit()) =>
        {
            input.to_string()
        }
        _ => return Err(invalid()),
    };

    let (hours, minutes) = normalised.split_once(':').ok_or_else(invalid)?;
    let hours: u32 = hours.parse().map_err(|_| invalid())?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }

    Ok(format!("{hours:02}:{minutes:02}"))
}

/// Parses an `HH:MM` value.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, ValidationError> {
    NaiveTime::parse_from_str(value.trim(), HHMM_FORMAT)
        .map_err(|_| ValidationError::InvalidTime(value.trim().to_string()))
}

/// Checks that `end` is strictly after `start`.
pub fn check_start_before_end(start: &str, end: &str) -> Result<(), ValidationError> {
    let start_time = parse_hhmm(start)?;
    let end_time = parse_hhmm(end)?;
    if end_time <= start_time {
        return Err(ValidationError::EndNotAfterStart {
            start: start.to_string(),
            end: end.to_string(),
        });
    }
    Ok(())
}

/// Returns true when `current` lies strictly between `start` and `end`.
///
/// Comparison happens at minute precision, so 09:00:45 is not inside a
/// range that starts at 09:00. Unparseable bounds never contain anything.
pub fn is_time_in_range(current: NaiveTime, start: &str, end: &str) -> bool {
    let (Ok(start), Ok(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    let current = current
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(current);
    start < current && current < end
}

/// Combines the date of `now` with a schedule time in the same offset.
pub fn at_time_today(
    now: &DateTime<FixedOffset>,
    hhmm: &str,
) -> Result<DateTime<FixedOffset>, ValidationError> {
    let time = parse_hhmm(hhmm)?;
    now.offset()
        .from_local_datetime(&now.date_naive().and_time(time))
        .single()
        .ok_or_else(|| ValidationError::InvalidTime(hhmm.to_string()))
}

// ============================================================================
// Durations
// ============================================================================

/// Parses a duration such as `10s`, `30m`, `1h`, `2h30m` or `1.5h`.
///
/// Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, ValidationError> {
    let trimmed = input.trim();
    let invalid = || ValidationError::InvalidDuration(trimmed.to_string());

    if trimmed.is_empty() {
        return Err(invalid());
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total_nanos += value * scale;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Renders a duration as `1h 05m 03s`, dropping leading zero units.
pub fn humanize(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds:02}s"),
        _ => format!("{hours}h {minutes:02}m {seconds:02}s"),
    }
}
