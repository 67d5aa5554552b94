//! Five-field crontab schedules
//!
//! Supports the POSIX field set (minute, hour, day-of-month, month,
//! day-of-week) with wildcards, lists (`1,5`), ranges (`1-5`), and steps
//! (`*/15`). The `L`, `W`, and `#` extensions are not supported. All
//! computation is in UTC. Day-of-week accepts 0-7 with both 0 and 7 meaning
//! Sunday.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use finflow_common::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Upper bound on next-fire search steps; the walk skips whole months and
/// days, so this covers several years of non-matching candidates.
const MAX_SEARCH_STEPS: usize = 250_000;

/// A parsed crontab expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn bit_set(mask: u64, index: u32) -> bool {
    mask & (1u64 << index) != 0
}

/// Parse one field into a bitmask over `[min, max]`
fn parse_field(field: &str, min: u32, max: u32) -> Result<u64> {
    let mut mask = 0u64;

    for segment in field.split(',') {
        if segment.is_empty() {
            return Err(Error::Validation(format!(
                "empty segment in cron field: {field}"
            )));
        }

        let (range_part, step) = match segment.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| {
                    Error::Validation(format!("invalid cron step: {segment}"))
                })?;
                if step == 0 {
                    return Err(Error::Validation(format!("cron step must be positive: {segment}")));
                }
                (range, step)
            }
            None => (segment, 1),
        };

        let (start, end) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| Error::Validation(format!("invalid cron range: {segment}")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| Error::Validation(format!("invalid cron range: {segment}")))?;
            (a, b)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| Error::Validation(format!("invalid cron value: {segment}")))?;
            (v, v)
        };

        if start < min || end > max || start > end {
            return Err(Error::Validation(format!(
                "cron value out of range {min}-{max}: {segment}"
            )));
        }

        let mut value = start;
        while value <= end {
            mask |= 1u64 << value;
            value += step;
        }
    }

    Ok(mask)
}

impl CronSchedule {
    /// Parse a five-field crontab expression
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!(
                "cron expression must have 5 fields, got {}: {expression}",
                fields.len()
            )));
        }

        let minutes = parse_field(fields[0], 0, 59)?;
        let hours = parse_field(fields[1], 0, 23)?;
        let days_of_month = parse_field(fields[2], 1, 31)?;
        let months = parse_field(fields[3], 1, 12)?;

        // Day of week allows 0-7; fold 7 (Sunday) onto 0.
        let mut days_of_week = parse_field(fields[4], 0, 7)?;
        if bit_set(days_of_week, 7) {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expression: expression.to_string(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom_ok = bit_set(self.days_of_month, t.day());
        let dow_ok = bit_set(self.days_of_week, t.weekday().num_days_from_sunday());
        // POSIX: when both fields are restricted, either may match.
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Whether `t` (truncated to its minute) matches the schedule
    pub fn matches(&self, t: DateTime<Utc>) -> bool {
        bit_set(self.minutes, t.minute())
            && bit_set(self.hours, t.hour())
            && bit_set(self.months, t.month())
            && self.day_matches(t)
    }

    /// Smallest matching minute strictly greater than `after`, in UTC.
    ///
    /// Returns `None` when no instant matches within the search horizon
    /// (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);

        for _ in 0..MAX_SEARCH_STEPS {
            if !bit_set(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?
                    .and_hms_opt(0, 0, 0)?
                    .and_utc();
                continue;
            }
            if !self.day_matches(t) {
                t = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?.and_utc();
                continue;
            }
            if !bit_set(self.hours, t.hour()) {
                t = (t + chrono::Duration::hours(1)).with_minute(0)?;
                continue;
            }
            if !bit_set(self.minutes, t.minute()) {
                t = t + chrono::Duration::minutes(1);
                continue;
            }
            return Some(t);
        }

        None
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
