//! Input validation and normalisation.
//!
//! Everything a user types (site URLs, weekday names, schedule names)
//! passes through this module before it reaches a persisted record.

use chrono::Weekday;
use thiserror::Error;

/// Prefixes stripped from a URL when deriving a display name.
const NAME_PREFIXES: [&str; 3] = ["www.", "https://", "http://"];

/// Suffixes stripped from a URL when deriving a display name.
const NAME_SUFFIXES: [&str; 2] = [".com", ".org"];

/// Weekday names in the order used by persisted schedules.
pub const WEEKDAY_KEYS: [&str; 7] = [
    "sunday",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
];

// ============================================================================
// ValidationError
// ============================================================================

/// Errors raised when user input fails validation.
///
/// These are reported at the point of input and never silently corrected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Input was empty after trimming.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// Time was not in HH:MM (or HHMM) 24-hour form.
    #[error("invalid time '{0}': expected HH:MM in 24-hour format")]
    InvalidTime(String),

    /// End time is not strictly after start time.
    #[error("end time {end} must be after start time {start}")]
    EndNotAfterStart {
        /// Start of the range
        start: String,
        /// End of the range
        end: String,
    },

    /// Weekday name not recognised.
    #[error("invalid weekday '{0}'")]
    InvalidWeekday(String),

    /// Duration string could not be parsed.
    #[error("invalid duration '{0}': use forms like 10s, 30m, 1h, 2h30m")]
    InvalidDuration(String),

    /// Site already present in the list.
    #[error("site '{0}' is already in the block list")]
    DuplicateSite(String),

    /// Site not present in the list.
    #[error("site '{0}' not found")]
    SiteNotFound(String),

    /// Schedule name already used.
    #[error("schedule '{0}' already exists")]
    DuplicateSchedule(String),

    /// Schedule name not found.
    #[error("schedule '{0}' not found")]
    ScheduleNotFound(String),

    /// Weekday already has an entry in the schedule map.
    #[error("{0} already exists in the schedule")]
    DuplicateDay(String),

    /// Weekday has no entry in the schedule map.
    #[error("{0} does not exist in the schedule")]
    DayNotFound(String),

    /// Index into a day's time ranges is out of bounds (1-based).
    #[error("no time range #{index} for {day}")]
    RangeNotFound {
        /// Day key
        day: String,
        /// 1-based index supplied by the user
        index: usize,
    },

    /// Password does not meet the strength rules.
    #[error("weak password: {0}")]
    WeakPassword(&'static str),
}

// ============================================================================
// Normalisation
// ============================================================================

/// Lower-cases and trims a value and removes interior spaces.
pub fn format_string(data: &str) -> String {
    data.trim().to_lowercase().replace(' ', "")
}

/// Normalises a site URL, rejecting empty input.
pub fn normalize_url(url: &str) -> Result<String, ValidationError> {
    let url = format_string(url);
    if url.is_empty() {
        return Err(ValidationError::Empty("site URL"));
    }
    Ok(url)
}

/// Derives a short display name from a URL.
///
/// `https://www.example.com` becomes `example`. The URL itself is
/// never modified this way; only the derived name is.
pub fn name_from_url(url: &str) -> String {
    let mut name = format_string(url);
    for prefix in NAME_PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            name = rest.to_string();
        }
    }
    for suffix in NAME_SUFFIXES {
        if let Some(rest) = name.strip_suffix(suffix) {
            name = rest.to_string();
        }
    }
    name
}

/// Parses a weekday name ("Monday", " monday ", "MON" is rejected).
pub fn parse_weekday(day: &str) -> Result<Weekday, ValidationError> {
    match format_string(day).as_str() {
        "sunday" => Ok(Weekday::Sun),
        "monday" => Ok(Weekday::Mon),
        "tuesday" => Ok(Weekday::Tue),
        "wednesday" => Ok(Weekday::Wed),
        "thursday" => Ok(Weekday::Thu),
        "friday" => Ok(Weekday::Fri),
        "saturday" => Ok(Weekday::Sat),
        _ => Err(ValidationError::InvalidWeekday(day.trim().to_string())),
    }
}

/// Returns the persisted key for a weekday.
pub fn weekday_key(day: Weekday) -> &'static str {
    WEEKDAY_KEYS[day.num_days_from_sunday() as usize]
}

/// Splits a comma- or whitespace-separated list of weekday names.
pub fn parse_weekday_list(input: &str) -> Result<Vec<Weekday>, ValidationError> {
    let mut days = Vec::new();
    for part in input.split(|c: char| c == ',' || c.is_whitespace()) {
        if part.trim().is_empty() {
            continue;
        }
        let day = parse_weekday(part)?;
        if !days.contains(&day) {
            days.push(day);
        }
    }
    if days.is_empty() {
        return Err(ValidationError::Empty("day list"));
    }
    Ok(days)
}

/// Checks password strength.
///
/// At least 8 characters with an uppercase letter, a lowercase letter,
/// a digit and one of `!@#$%^&*(),.?":{}|<>`.
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    const SPECIAL: &str = "!@#$%^&*(),.?\":{}|<>";

    if password.chars().count() < 8 {
        return Err(ValidationError::WeakPassword(
            "must be at least 8 characters long",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one uppercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one lowercase letter",
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one digit",
        ));
    }
    if !password.chars().any(|c| SPECIAL.contains(c)) {
        return Err(ValidationError::WeakPassword(
            "must contain at least one special character",
        ));
    }
    Ok(())
}
