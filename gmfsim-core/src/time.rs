//! Simulation clock helpers.
//!
//! All simulation time is expressed as milliseconds since the Unix epoch
//! (UTC). Quantities in module definitions carry a [`TimeUnit`] and are
//! converted to milliseconds with the same granularity rules everywhere:
//! calendar-sized units truncate to whole days, days truncate to whole
//! hours and hours truncate to whole minutes.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

pub const SECOND: i64 = 1_000;
pub const MINUTE: i64 = 60 * SECOND;
pub const HOUR: i64 = 60 * MINUTE;
pub const DAY: i64 = 24 * HOUR;
pub const WEEK: i64 = 7 * DAY;

/// Length of a year used for ages: 365.25 days.
pub const YEAR: i64 = 31_557_600_000;

/// Unit of a time quantity in a module definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[serde(alias = "millisecond")]
    Milliseconds,
    #[serde(alias = "second")]
    Seconds,
    #[serde(alias = "minute")]
    Minutes,
    #[serde(alias = "hour")]
    Hours,
    #[serde(alias = "day")]
    Days,
    #[serde(alias = "week")]
    Weeks,
    #[serde(alias = "month")]
    Months,
    #[serde(alias = "year")]
    Years,
}

impl TimeUnit {
    /// Converts a quantity in this unit to milliseconds.
    pub fn to_millis(self, quantity: f64) -> i64 {
        match self {
            TimeUnit::Milliseconds => quantity as i64,
            TimeUnit::Seconds => (1000.0 * quantity) as i64,
            TimeUnit::Minutes => (60.0 * quantity) as i64 * SECOND,
            TimeUnit::Hours => (60.0 * quantity) as i64 * MINUTE,
            TimeUnit::Days => (24.0 * quantity) as i64 * HOUR,
            TimeUnit::Weeks => (7.0 * quantity) as i64 * DAY,
            TimeUnit::Months => (30.0 * quantity) as i64 * DAY,
            TimeUnit::Years => (365.25 * quantity) as i64 * DAY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "milliseconds",
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A quantity of time, e.g. `{"quantity": 3, "unit": "days"}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub quantity: f64,
    pub unit: TimeUnit,
}

impl Quantity {
    pub fn millis(&self) -> i64 {
        self.unit.to_millis(self.quantity)
    }
}

pub fn datetime(time: Timestamp) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(time)
}

/// Calendar year of `time` in UTC.
pub fn year_of(time: Timestamp) -> Option<i32> {
    datetime(time).map(|dt| dt.year())
}

/// Calendar month (1-12) of `time` in UTC.
pub fn month_of(time: Timestamp) -> Option<u32> {
    datetime(time).map(|dt| dt.month())
}

/// Timestamp of midnight UTC on January 1st of `year`.
pub fn start_of_year(year: i32) -> Option<Timestamp> {
    Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0)
        .single()
        .map(|dt| dt.timestamp_millis())
}
