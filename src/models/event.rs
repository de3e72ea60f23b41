//! Input event model

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::scope::Calendar;

/// Validation failure for a single event. Raised before any storage write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidEventError {
    #[error("empty event client-id")]
    ClientId,
    #[error("empty event action")]
    Action,
    #[error("empty event target")]
    Target,
    #[error("empty event target type")]
    TargetType,
}

/// An "action on target" occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Client (tenant) the event belongs to
    pub client_id: String,

    /// Entity being acted upon
    pub target: String,

    /// Kind of the target, e.g. "page"
    pub target_type: String,

    /// Verb applied to the target, e.g. "view"
    pub action: String,

    /// When the action happened. Calendar fields are always derived in UTC.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_owners: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tags: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Event {
    /// Create an event happening now
    pub fn new(
        client_id: impl Into<String>,
        target: impl Into<String>,
        target_type: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            target: target.into(),
            target_type: target_type.into(),
            action: action.into(),
            timestamp: Utc::now(),
            target_owners: None,
            target_tags: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_owners<I, S>(mut self, owners: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_owners = Some(owners.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the required fields, in client-id, action, target, target type order.
    pub fn validate(&self) -> Result<(), InvalidEventError> {
        if is_blank(&self.client_id) {
            return Err(InvalidEventError::ClientId);
        }
        if is_blank(&self.action) {
            return Err(InvalidEventError::Action);
        }
        if is_blank(&self.target) {
            return Err(InvalidEventError::Target);
        }
        if is_blank(&self.target_type) {
            return Err(InvalidEventError::TargetType);
        }
        Ok(())
    }

    pub fn calendar(&self) -> Calendar {
        Calendar::of(&self.timestamp)
    }

    pub fn year(&self) -> i32 {
        self.calendar().year
    }

    pub fn month(&self) -> u32 {
        self.calendar().month
    }

    /// ISO-8601 week number
    pub fn week(&self) -> u32 {
        self.calendar().week
    }

    pub fn day(&self) -> u32 {
        self.calendar().day
    }

    pub fn hour(&self) -> u32 {
        self.calendar().hour
    }

    /// First instant of the event's UTC month
    pub fn year_month_date(&self) -> DateTime<Utc> {
        month_start(&self.timestamp)
    }
}

/// Truncate an instant to 00:00 UTC on the first day of its month
pub fn month_start(instant: &DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(instant.year(), instant.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(*instant)
}

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event::new("client", "target", "type", "action")
            .at(Utc.with_ymd_and_hms(2011, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_reports_first_blank_field() {
        let mut event = Event::new("", "", "", "");
        assert_eq!(event.validate(), Err(InvalidEventError::ClientId));

        event.client_id = "c".into();
        assert_eq!(event.validate(), Err(InvalidEventError::Action));

        event.action = "view".into();
        event.target = "   ".into();
        assert_eq!(event.validate(), Err(InvalidEventError::Target));

        event.target = "t".into();
        assert_eq!(event.validate(), Err(InvalidEventError::TargetType));
    }

    #[test]
    fn test_year_month_date() {
        let event = sample().at(Utc.with_ymd_and_hms(2011, 1, 17, 13, 45, 12).unwrap());
        let ym = event.year_month_date();
        assert_eq!(ym.timestamp_millis(), 1293840000000);
        assert_eq!(event.year(), 2011);
        assert_eq!(event.month(), 1);
        assert_eq!(event.day(), 17);
        assert_eq!(event.hour(), 13);
    }

    #[test]
    fn test_week() {
        assert_eq!(sample().week(), 52);
        let event = sample().at(Utc.with_ymd_and_hms(2003, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(event.week(), 1);
    }

    #[test]
    fn test_deserialize_defaults() {
        let event: Event = serde_json::from_str(
            r#"{"client_id":"c","target":"t","target_type":"page","action":"view","metadata":{"ip":"10.0.0.1"}}"#,
        )
        .unwrap();
        assert!(event.target_owners.is_none());
        assert_eq!(event.metadata.len(), 1);
        assert!(event.validate().is_ok());
    }
}
