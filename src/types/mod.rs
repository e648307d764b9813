//! Core data types for selfcontrol.
//!
//! This module defines the persisted records:
//! - `Config` (`config.yaml`): sites, weekly schedules and current status
//! - `SiteList` / `BlockEntry` (`blocked-sites.yaml`): per-site blocks
//! - `Schedule`: the named, multi-day authoring form of a time range

pub mod validation;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Weekday};
use serde::{Deserialize, Deserializer, Serialize};

use crate::timeutil::{self, check_start_before_end, format_time};

pub use validation::ValidationError;

/// Timer key used for the batch block covering every configured site.
pub const COMBINED_KEY: &str = "combined";

// ============================================================================
// Mode
// ============================================================================

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Blocks can be lifted by the user at any time
    #[default]
    Normal,
    /// Blocks cannot be lifted until they expire
    Strict,
}

impl Mode {
    /// Returns the string representation of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Strict => "strict",
        }
    }

    /// Returns true for strict mode.
    pub fn is_strict(&self) -> bool {
        matches!(self, Mode::Strict)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "normal" => Ok(Mode::Normal),
            "strict" => Ok(Mode::Strict),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Reads a flag written either as a YAML boolean or as `"true"`/`"false"`.
fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(false),
        Some(Flag::Bool(value)) => Ok(value),
        Some(Flag::Text(text)) => match text.trim().to_lowercase().as_str() {
            "" | "false" => Ok(false),
            "true" => Ok(true),
            other => Err(serde::de::Error::custom(format!("invalid flag '{other}'"))),
        },
    }
}

/// Reads an optional string, mapping YAML null to empty.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parses a persisted timestamp field, treating empty as unset.
fn timestamp_field(
    field: &'static str,
    value: &str,
) -> Result<Option<DateTime<FixedOffset>>, InvalidTimestamp> {
    if value.trim().is_empty() {
        return Ok(None);
    }
    timeutil::parse_timestamp(value)
        .map(Some)
        .map_err(|_| InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

/// A persisted timestamp that does not match the block timestamp layout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp in '{field}': '{value}'")]
pub struct InvalidTimestamp {
    /// Field name as persisted
    pub field: &'static str,
    /// Raw value
    pub value: String,
}

// ============================================================================
// Config
// ============================================================================

/// A time range within one day, `HH:MM` to `HH:MM`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Range start (exclusive when matching)
    pub start: String,
    /// Range end (exclusive when matching)
    pub end: String,
    /// Name of the schedule that created this range, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TimeRange {
    /// Creates a validated, unnamed range.
    pub fn new(start: &str, end: &str) -> Result<Self, ValidationError> {
        let start = format_time(start)?;
        let end = format_time(end)?;
        check_start_before_end(&start, &end)?;
        Ok(Self {
            start,
            end,
            name: None,
        })
    }

    /// Attaches a schedule name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Block status persisted alongside the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentStatus {
    /// When the current block started
    #[serde(default, deserialize_with = "lenient_string")]
    pub started_at: String,
    /// When the current custom-time block ends
    #[serde(default, deserialize_with = "lenient_string")]
    pub ended_at: String,
    /// Operating mode
    #[serde(default)]
    pub mode: Mode,
    /// Whether the next start should resume blocking
    #[serde(default, deserialize_with = "lenient_bool")]
    pub block_on_restart: bool,
    /// Whether the current block is custom-time rather than schedule-driven
    #[serde(default, deserialize_with = "lenient_bool")]
    pub block_custom_time: bool,
}

impl CurrentStatus {
    /// Parses `ended_at`.
    pub fn ended_at(&self) -> Result<Option<DateTime<FixedOffset>>, InvalidTimestamp> {
        timestamp_field("ended_at", &self.ended_at)
    }

    /// Parses `started_at`.
    pub fn started_at(&self) -> Result<Option<DateTime<FixedOffset>>, InvalidTimestamp> {
        timestamp_field("started_at", &self.started_at)
    }
}

/// The main configuration record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// URLs blocked by combined blocks
    #[serde(default)]
    pub sites: Vec<String>,
    /// Weekday key (`monday`, ...) to time ranges
    #[serde(default)]
    pub schedules: BTreeMap<String, Vec<TimeRange>>,
    /// Current block status
    #[serde(default)]
    pub current_status: CurrentStatus,
}

impl Config {
    /// Returns the ranges for a weekday, if any.
    pub fn ranges_for(&self, day: Weekday) -> Option<&[TimeRange]> {
        self.schedules
            .get(validation::weekday_key(day))
            .map(Vec::as_slice)
    }

    /// Returns true if the site list contains `url` (case-insensitive).
    pub fn has_site(&self, url: &str) -> bool {
        self.sites.iter().any(|s| s.eq_ignore_ascii_case(url))
    }
}

// ============================================================================
// Per-site records
// ============================================================================

/// A single blockable site with its own expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Display name derived from the URL
    pub name: String,
    /// Normalised URL
    pub url: String,
    /// Absolute expiry timestamp, empty when never blocked
    #[serde(default, deserialize_with = "lenient_string")]
    pub duration: String,
    /// Whether the site is blocked right now
    #[serde(rename = "currentlyBlocked", default)]
    pub currently_blocked: bool,
}

impl BlockEntry {
    /// Creates an unblocked entry for a normalised URL.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: validation::name_from_url(&url),
            url,
            duration: String::new(),
            currently_blocked: false,
        }
    }

    /// Parses the expiry timestamp.
    pub fn expiry(&self) -> Result<Option<DateTime<FixedOffset>>, InvalidTimestamp> {
        timestamp_field("duration", &self.duration)
    }
}

/// Header record of `blocked-sites.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteList {
    /// Per-site entries
    #[serde(default)]
    pub sites: Vec<BlockEntry>,
}

impl SiteList {
    /// Finds an entry by URL.
    pub fn get(&self, url: &str) -> Option<&BlockEntry> {
        self.sites.iter().find(|s| s.url == url)
    }

    /// Finds an entry by URL for mutation.
    pub fn get_mut(&mut self, url: &str) -> Option<&mut BlockEntry> {
        self.sites.iter_mut().find(|s| s.url == url)
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// A named schedule covering the same time range on several weekdays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    /// Unique schedule name
    pub name: String,
    /// Days the schedule applies to
    pub days: Vec<Weekday>,
    /// Start time (HH:MM)
    pub start_time: String,
    /// End time (HH:MM)
    pub end_time: String,
}

impl Schedule {
    /// Creates a validated schedule.
    pub fn new(
        name: &str,
        days: Vec<Weekday>,
        start_time: &str,
        end_time: &str,
    ) -> Result<Self, ValidationError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::Empty("schedule name"));
        }
        if days.is_empty() {
            return Err(ValidationError::Empty("day list"));
        }
        let range = TimeRange::new(start_time, end_time)?;
        Ok(Self {
            name: name.to_string(),
            days,
            start_time: range.start,
            end_time: range.end,
        })
    }

    /// Returns the range stored under each of the schedule's days.
    pub fn range(&self) -> TimeRange {
        TimeRange {
            start: self.start_time.clone(),
            end: self.end_time.clone(),
            name: Some(self.name.clone()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
