//! Edits applied to a loaded [`Config`].
//!
//! The weekly map stores plain time ranges per weekday. A named
//! [`Schedule`] is stored as one range per day tagged with its name, so it
//! can later be listed, edited or removed as a unit.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, FixedOffset, Weekday};

use crate::timeutil::{check_start_before_end, format_time, is_time_in_range};
use crate::types::validation::{self, normalize_url, weekday_key};
use crate::types::{Config, Schedule, TimeRange, ValidationError};

type EditResult<T> = std::result::Result<T, ValidationError>;

fn day_name(day: Weekday) -> String {
    weekday_key(day).to_string()
}

impl Config {
    // ------------------------------------------------------------------------
    // Sites
    // ------------------------------------------------------------------------

    /// Adds a site, returning its normalised URL.
    pub fn add_site(&mut self, url: &str) -> EditResult<String> {
        let url = normalize_url(url)?;
        if self.has_site(&url) {
            return Err(ValidationError::DuplicateSite(url));
        }
        self.sites.push(url.clone());
        Ok(url)
    }

    /// Removes a site, returning its normalised URL.
    pub fn remove_site(&mut self, url: &str) -> EditResult<String> {
        let url = normalize_url(url)?;
        let index = self
            .sites
            .iter()
            .position(|s| s.eq_ignore_ascii_case(&url))
            .ok_or_else(|| ValidationError::SiteNotFound(url.clone()))?;
        Ok(self.sites.remove(index))
    }

    // ------------------------------------------------------------------------
    // Named schedules
    // ------------------------------------------------------------------------

    fn has_schedule(&self, name: &str) -> bool {
        self.schedules
            .values()
            .flatten()
            .any(|range| range.name.as_deref() == Some(name))
    }

    /// Lists named schedules, ordered by name.
    pub fn named_schedules(&self) -> Vec<Schedule> {
        let mut by_name: BTreeMap<&str, Schedule> = BTreeMap::new();
        for day in validation::WEEKDAY_KEYS {
            let Some(ranges) = self.schedules.get(day) else {
                continue;
            };
            let Ok(weekday) = validation::parse_weekday(day) else {
                continue;
            };
            for range in ranges {
                let Some(name) = range.name.as_deref() else {
                    continue;
                };
                by_name
                    .entry(name)
                    .or_insert_with(|| Schedule {
                        name: name.to_string(),
                        days: Vec::new(),
                        start_time: range.start.clone(),
                        end_time: range.end.clone(),
                    })
                    .days
                    .push(weekday);
            }
        }
        by_name.into_values().collect()
    }

    /// Adds a named schedule.
    pub fn add_schedule(&mut self, schedule: &Schedule) -> EditResult<()> {
        if self.has_schedule(&schedule.name) {
            return Err(ValidationError::DuplicateSchedule(schedule.name.clone()));
        }
        for day in &schedule.days {
            self.schedules
                .entry(day_name(*day))
                .or_default()
                .push(schedule.range());
        }
        Ok(())
    }

    /// Removes every range belonging to schedule `name`.
    pub fn remove_schedule(&mut self, name: &str) -> EditResult<()> {
        if !self.has_schedule(name) {
            return Err(ValidationError::ScheduleNotFound(name.to_string()));
        }
        for ranges in self.schedules.values_mut() {
            ranges.retain(|range| range.name.as_deref() != Some(name));
        }
        self.schedules.retain(|_, ranges| !ranges.is_empty());
        Ok(())
    }

    /// Replaces schedule `name` with `schedule`, which may carry a new name.
    pub fn edit_schedule(&mut self, name: &str, schedule: &Schedule) -> EditResult<()> {
        if !self.has_schedule(name) {
            return Err(ValidationError::ScheduleNotFound(name.to_string()));
        }
        if schedule.name != name && self.has_schedule(&schedule.name) {
            return Err(ValidationError::DuplicateSchedule(schedule.name.clone()));
        }
        self.remove_schedule(name)?;
        self.add_schedule(schedule)
    }

    // ------------------------------------------------------------------------
    // Per-day ranges
    // ------------------------------------------------------------------------

    /// Adds a day with its first range.
    pub fn add_day(&mut self, day: Weekday, range: TimeRange) -> EditResult<()> {
        let key = day_name(day);
        if self.schedules.contains_key(&key) {
            return Err(ValidationError::DuplicateDay(key));
        }
        self.schedules.insert(key, vec![range]);
        Ok(())
    }

    /// Removes a day and all of its ranges.
    pub fn remove_day(&mut self, day: Weekday) -> EditResult<Vec<TimeRange>> {
        let key = day_name(day);
        self.schedules
            .remove(&key)
            .ok_or(ValidationError::DayNotFound(key))
    }

    /// Appends a range to a day, creating the day if needed.
    pub fn add_range(&mut self, day: Weekday, range: TimeRange) {
        self.schedules.entry(day_name(day)).or_default().push(range);
    }

    fn range_mut(&mut self, day: Weekday, index: usize) -> EditResult<&mut TimeRange> {
        let key = day_name(day);
        let ranges = self
            .schedules
            .get_mut(&key)
            .ok_or_else(|| ValidationError::DayNotFound(key.clone()))?;
        index
            .checked_sub(1)
            .and_then(|i| ranges.get_mut(i))
            .ok_or(ValidationError::RangeNotFound { day: key, index })
    }

    /// Removes the `index`-th range (1-based) of a day.
    ///
    /// The day itself goes once its last range is removed.
    pub fn remove_range(&mut self, day: Weekday, index: usize) -> EditResult<TimeRange> {
        self.range_mut(day, index)?;
        let key = day_name(day);
        let ranges = self
            .schedules
            .get_mut(&key)
            .ok_or_else(|| ValidationError::DayNotFound(key.clone()))?;
        let removed = ranges.remove(index - 1);
        if ranges.is_empty() {
            self.schedules.remove(&key);
        }
        Ok(removed)
    }

    /// Changes the start of the `index`-th range (1-based) of a day.
    pub fn set_range_start(&mut self, day: Weekday, index: usize, start: &str) -> EditResult<()> {
        let start = format_time(start)?;
        let range = self.range_mut(day, index)?;
        check_start_before_end(&start, &range.end)?;
        range.start = start;
        Ok(())
    }

    /// Changes the end of the `index`-th range (1-based) of a day.
    pub fn set_range_end(&mut self, day: Weekday, index: usize, end: &str) -> EditResult<()> {
        let end = format_time(end)?;
        let range = self.range_mut(day, index)?;
        check_start_before_end(&range.start, &end)?;
        range.end = end;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Matching
    // ------------------------------------------------------------------------

    /// Returns today's range containing `now`, if any.
    pub fn active_range(&self, now: &DateTime<FixedOffset>) -> Option<&TimeRange> {
        self.ranges_for(now.weekday())?
            .iter()
            .find(|range| is_time_in_range(now.time(), &range.start, &range.end))
    }
}
