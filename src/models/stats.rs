//! Query result models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named counter, optionally pinned to a date
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCounter {
    pub name: String,
    pub count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl StatCounter {
    pub fn new(name: impl Into<String>, count: i64) -> Self {
        Self {
            name: name.into(),
            count,
            date: None,
        }
    }

    pub fn dated(name: impl Into<String>, count: i64, date: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            count,
            date: Some(date),
        }
    }

    pub fn add(&mut self, count: i64) {
        self.count += count;
    }
}

/// Counter for an action with its breakdown
///
/// `targets` holds per-target-type counts for action totals and per-date
/// counts for target stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatAction {
    pub name: String,
    pub count: i64,
    pub targets: Vec<StatCounter>,
}

impl StatAction {
    pub fn new(name: impl Into<String>, count: i64) -> Self {
        Self {
            name: name.into(),
            count,
            targets: Vec::new(),
        }
    }

    pub fn add(&mut self, count: i64) {
        self.count += count;
    }
}
