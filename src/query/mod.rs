//! Query descriptors
//!
//! A [`Query`] is a bag of field filters plus result shaping. Each engine
//! operation declares which fields it requires and reads the rest as optional
//! refinements.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryField {
    ClientId,
    Target,
    TargetType,
    TargetOwner,
    TargetTags,
    Action,
    DateFrom,
    DateTo,
}

impl QueryField {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryField::ClientId => "client_id",
            QueryField::Target => "target",
            QueryField::TargetType => "target_type",
            QueryField::TargetOwner => "target_owner",
            QueryField::TargetTags => "target_tags",
            QueryField::Action => "action",
            QueryField::DateFrom => "date_from",
            QueryField::DateTo => "date_to",
        }
    }
}

impl fmt::Display for QueryField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryOp {
    #[default]
    Eq,
    In,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    #[default]
    Null,
    Date(DateTime<Utc>),
    Text(String),
    List(Vec<String>),
}

impl From<&str> for FilterValue {
    fn from(value: &str) -> Self {
        FilterValue::Text(value.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(value: String) -> Self {
        FilterValue::Text(value)
    }
}

impl From<Vec<String>> for FilterValue {
    fn from(values: Vec<String>) -> Self {
        FilterValue::List(values)
    }
}

impl From<Vec<&str>> for FilterValue {
    fn from(values: Vec<&str>) -> Self {
        FilterValue::List(values.into_iter().map(str::to_string).collect())
    }
}

impl From<DateTime<Utc>> for FilterValue {
    fn from(value: DateTime<Utc>) -> Self {
        FilterValue::Date(value)
    }
}

impl<T: Into<FilterValue>> From<Option<T>> for FilterValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FilterValue::Null)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    #[serde(default)]
    pub op: QueryOp,
    #[serde(default)]
    pub value: FilterValue,
}

impl QueryFilter {
    pub fn eq(value: impl Into<FilterValue>) -> Self {
        Self {
            op: QueryOp::Eq,
            value: value.into(),
        }
    }

    pub fn is_in(value: impl Into<FilterValue>) -> Self {
        Self {
            op: QueryOp::In,
            value: value.into(),
        }
    }

    /// Null, blank text and empty lists carry no constraint
    pub fn is_empty(&self) -> bool {
        match &self.value {
            FilterValue::Null => true,
            FilterValue::Text(text) => text.trim().is_empty(),
            FilterValue::List(values) => values.is_empty(),
            FilterValue::Date(_) => false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.value {
            FilterValue::Text(text) => Some(text.as_str()),
            FilterValue::List(values) if values.len() == 1 => Some(values[0].as_str()),
            _ => None,
        }
    }

    /// Values as JSON, for equality or membership conditions
    pub fn values(&self) -> Vec<Value> {
        match &self.value {
            FilterValue::Null => Vec::new(),
            FilterValue::Text(text) => vec![Value::from(text.as_str())],
            FilterValue::List(values) => values.iter().map(|v| Value::from(v.as_str())).collect(),
            FilterValue::Date(date) => vec![Value::from(date.timestamp_millis())],
        }
    }

    /// Date value, parsing RFC 3339 or `YYYY-MM-DD` text
    pub fn date_value(&self) -> Option<DateTime<Utc>> {
        match &self.value {
            FilterValue::Date(date) => Some(*date),
            FilterValue::Text(text) => parse_date(text.trim()),
            _ => None,
        }
    }
}

pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_rfc3339(text) {
        return Some(date.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Filters and result shaping for one read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default)]
    pub filters: BTreeMap<QueryField, QueryFilter>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub ascending: bool,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality filter
    pub fn filter_by(self, field: QueryField, value: impl Into<FilterValue>) -> Self {
        self.filter(field, QueryFilter::eq(value))
    }

    pub fn filter(mut self, field: QueryField, filter: QueryFilter) -> Self {
        self.filters.insert(field, filter);
        self
    }

    pub fn limit(mut self, max_results: usize) -> Self {
        self.max_results = Some(max_results);
        self
    }

    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// Non-empty filter on `field`
    pub fn get(&self, field: QueryField) -> Option<&QueryFilter> {
        self.filters.get(&field).filter(|filter| !filter.is_empty())
    }

    pub fn require(&self, field: QueryField) -> Result<&QueryFilter> {
        self.get(field).ok_or(Error::RequiredField(field))
    }

    /// Fail unless at least one of `fields` carries a value
    pub fn require_some(&self, fields: &[QueryField]) -> Result<()> {
        if fields.iter().any(|field| self.get(*field).is_some()) {
            Ok(())
        } else {
            Err(Error::SomeRequiredField(fields.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_filters() {
        assert!(QueryFilter::eq(FilterValue::Null).is_empty());
        assert!(QueryFilter::eq("  ").is_empty());
        assert!(QueryFilter::is_in(Vec::<String>::new()).is_empty());
        assert!(!QueryFilter::eq("x").is_empty());
    }

    #[test]
    fn test_require_skips_empty_values() {
        let query = Query::new()
            .filter_by(QueryField::ClientId, "")
            .filter_by(QueryField::TargetType, "page");
        assert!(matches!(
            query.require(QueryField::ClientId),
            Err(Error::RequiredField(QueryField::ClientId))
        ));
        assert!(query.require(QueryField::TargetType).is_ok());
        assert!(matches!(
            query.require_some(&[QueryField::Target, QueryField::TargetOwner]),
            Err(Error::SomeRequiredField(_))
        ));
    }

    #[test]
    fn test_date_value_parsing() {
        let expected = Utc.with_ymd_and_hms(2011, 2, 1, 0, 0, 0).unwrap();
        assert_eq!(QueryFilter::eq("2011-02-01").date_value(), Some(expected));
        assert_eq!(
            QueryFilter::eq("2011-02-01T00:00:00Z").date_value(),
            Some(expected)
        );
        assert_eq!(QueryFilter::eq(expected).date_value(), Some(expected));
        assert_eq!(QueryFilter::eq("february").date_value(), None);
    }

    #[test]
    fn test_deserialize_query() {
        let query: Query = serde_json::from_str(
            r#"{"filters":{"client_id":{"value":"c"},"target":{"op":"in","value":["a","b"]}},"max_results":5}"#,
        )
        .unwrap();
        assert_eq!(query.get(QueryField::ClientId).and_then(|f| f.text()), Some("c"));
        assert_eq!(query.get(QueryField::Target).map(|f| f.op), Some(QueryOp::In));
        assert_eq!(query.max_results, Some(5));
    }
}
