//! Time scopes and the bucket naming scheme built on them.
//!
//! Every counter family lives in a bucket whose name is derived from a prefix,
//! a [`TimeScope`] and the UTC calendar fields of an instant. Broader scopes
//! collapse narrower ones: all instants of one UTC month share the monthly
//! bucket name, and the monthly calendar chain is a prefix of the daily and
//! hourly chains.

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Time granularity used for bucket partitioning and rollup grouping.
///
/// Variants are declared from narrowest to broadest, so the derived ordering
/// is the scope hierarchy: `Hourly < Daily < Weekly < Monthly < Annual < Global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeScope {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Annual,
    Global,
}

/// A calendar component appended to a scoped bucket name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarUnit {
    Week,
    Month,
    Day,
    Hour,
}

const MONTH_CHAIN: [CalendarUnit; 3] = [CalendarUnit::Month, CalendarUnit::Day, CalendarUnit::Hour];

impl TimeScope {
    pub const ALL: [TimeScope; 6] = [
        TimeScope::Hourly,
        TimeScope::Daily,
        TimeScope::Weekly,
        TimeScope::Monthly,
        TimeScope::Annual,
        TimeScope::Global,
    ];

    /// Short key used in bucket and function names.
    pub fn key(&self) -> &'static str {
        match self {
            TimeScope::Hourly => "h",
            TimeScope::Daily => "d",
            TimeScope::Weekly => "w",
            TimeScope::Monthly => "m",
            TimeScope::Annual => "a",
            TimeScope::Global => "g",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TimeScope::Hourly => "HOURLY",
            TimeScope::Daily => "DAILY",
            TimeScope::Weekly => "WEEKLY",
            TimeScope::Monthly => "MONTHLY",
            TimeScope::Annual => "ANNUAL",
            TimeScope::Global => "GLOBAL",
        }
    }

    /// Calendar units appended after `_<key><year>`.
    ///
    /// Monthly, daily and hourly share one chain truncated at their depth.
    pub fn calendar_units(&self) -> &'static [CalendarUnit] {
        match self {
            TimeScope::Global | TimeScope::Annual => &[],
            TimeScope::Weekly => &[CalendarUnit::Week],
            TimeScope::Monthly => &MONTH_CHAIN[..1],
            TimeScope::Daily => &MONTH_CHAIN[..2],
            TimeScope::Hourly => &MONTH_CHAIN[..],
        }
    }

    /// True when `self` is strictly broader than `other`.
    pub fn is_broader_than(&self, other: TimeScope) -> bool {
        *self > other
    }
}

impl fmt::Display for TimeScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown time scope '{0}'")]
pub struct ParseTimeScopeError(String);

impl FromStr for TimeScope {
    type Err = ParseTimeScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        TimeScope::ALL
            .into_iter()
            .find(|scope| {
                scope.key().eq_ignore_ascii_case(wanted) || scope.name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| ParseTimeScopeError(s.to_string()))
    }
}

impl Serialize for TimeScope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name().to_lowercase())
    }
}

impl<'de> Deserialize<'de> for TimeScope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// UTC calendar fields of an instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    pub year: i32,
    pub month: u32,
    pub week: u32,
    pub day: u32,
    pub hour: u32,
}

impl Calendar {
    pub fn of(instant: &DateTime<Utc>) -> Self {
        Self {
            year: instant.year(),
            month: instant.month(),
            week: instant.iso_week().week(),
            day: instant.day(),
            hour: instant.hour(),
        }
    }

    fn unit(&self, unit: CalendarUnit) -> u32 {
        match unit {
            CalendarUnit::Week => self.week,
            CalendarUnit::Month => self.month,
            CalendarUnit::Day => self.day,
            CalendarUnit::Hour => self.hour,
        }
    }
}

/// Derive the bucket name for `prefix` at `instant` under `scope`.
///
/// `None` and [`TimeScope::Global`] return the prefix unchanged.
pub fn bucket_name(prefix: &str, instant: &DateTime<Utc>, scope: Option<TimeScope>) -> String {
    let scope = match scope {
        None | Some(TimeScope::Global) => return prefix.to_string(),
        Some(scope) => scope,
    };

    let calendar = Calendar::of(instant);
    let mut name = format!("{}_{}{}", prefix, scope.key(), calendar.year);
    for unit in scope.calendar_units() {
        name.push('_');
        name.push_str(&calendar.unit(*unit).to_string());
    }
    name
}
