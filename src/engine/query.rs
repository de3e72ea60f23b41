//! Read operations over the counter families

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::engine::fields;
use crate::engine::StatsEngine;
use crate::error::{Error, Result};
use crate::models::{StatAction, StatCounter};
use crate::query::{Query, QueryField, QueryFilter, QueryOp};
use crate::storage::document::get_path;
use crate::storage::{
    Condition, Document, DocumentStore, FieldPath, Filter, FindOptions, IndexSpec, SortOrder,
    StorageError,
};

const SLOW_QUERY: Duration = Duration::from_secs(1);
const DEFAULT_TOP_TARGETS: usize = 10;

fn query_error(operation: &'static str) -> impl FnOnce(StorageError) -> Error {
    move |source| {
        tracing::error!("{} failed: {}", operation, source);
        Error::QueryExecution { operation, source }
    }
}

/// Equality for one value, membership for several
fn filter_condition(filter: &QueryFilter) -> Condition {
    let mut values = filter.values();
    if filter.op == QueryOp::In || values.len() > 1 {
        Condition::In(values)
    } else {
        Condition::Eq(values.pop().unwrap_or(Value::Null))
    }
}

fn count_of(value: Option<&Value>) -> i64 {
    value.and_then(Value::as_i64).unwrap_or(0)
}

fn text_of(doc: &Document, field: &str) -> String {
    match doc.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl StatsEngine {
    /// Action totals, optionally restricted to one client
    pub async fn get_actions(&self, query: &Query) -> Result<Vec<StatAction>> {
        const OP: &str = "getActions";

        let mut filter = Filter::new();
        if let Some(client) = query.get(QueryField::ClientId) {
            filter = filter.with(FieldPath::field(fields::CLIENT), filter_condition(client));
        }

        let bucket = self.actions_bucket().await.map_err(query_error(OP))?;
        let options = FindOptions::new(filter)
            .project(vec![
                FieldPath::field(fields::ACTION),
                FieldPath::field(fields::TOTAL),
                FieldPath::field(fields::TARGETS),
            ])
            .limit(query.max_results);
        let docs = self
            .store
            .find(&bucket, &options)
            .await
            .map_err(query_error(OP))?;

        let actions = docs
            .iter()
            .map(|doc| {
                let mut action = StatAction::new(text_of(doc, fields::ACTION), count_of(doc.get(fields::TOTAL)));
                if let Some(Value::Object(targets)) = doc.get(fields::TARGETS) {
                    for (target_type, counter) in targets {
                        let count = count_of(counter.get(fields::COUNT));
                        action.targets.push(StatCounter::new(target_type.clone(), count));
                    }
                }
                action
            })
            .collect();

        Ok(actions)
    }

    /// Targets of one type ranked by their count for one action
    pub async fn get_top_targets(&self, query: &Query) -> Result<Vec<StatCounter>> {
        const OP: &str = "getTopTargets";

        let client = query.require(QueryField::ClientId)?;
        let target_type = query.require(QueryField::TargetType)?;
        let action = query.require(QueryField::Action)?;
        let action_name = action.text().ok_or_else(|| Error::InvalidFilter {
            field: QueryField::Action,
            reason: "exactly one action is supported".to_string(),
        })?;

        let count_path = FieldPath::field(fields::ACTIONS)
            .push(action_name)
            .push(fields::COUNT);
        let filter = Filter::new()
            .with(FieldPath::field(fields::CLIENT), filter_condition(client))
            .with(FieldPath::field(fields::TARGET_TYPE), filter_condition(target_type))
            .exists(count_path.clone());
        let order = if query.ascending {
            SortOrder::Ascending
        } else {
            SortOrder::Descending
        };

        let bucket = self.counters_bucket().await.map_err(query_error(OP))?;
        tracing::debug!("Ensuring index for {}", count_path);
        self.store
            .ensure_index(&bucket, &IndexSpec::single(count_path.clone()))
            .await
            .map_err(query_error(OP))?;

        let options = FindOptions::new(filter)
            .project(vec![FieldPath::field(fields::TARGET), FieldPath::field(fields::ACTIONS)])
            .sort(count_path.clone(), order)
            .limit(Some(query.max_results.unwrap_or(DEFAULT_TOP_TARGETS)));
        let docs = self
            .store
            .find(&bucket, &options)
            .await
            .map_err(query_error(OP))?;

        Ok(docs
            .iter()
            .map(|doc| {
                let count = get_path(doc, &count_path);
                StatCounter::new(text_of(doc, fields::TARGET), count_of(count))
            })
            .collect())
    }

    /// Per-action totals summed across matching global target counters
    pub async fn get_target_action_count(&self, query: &Query) -> Result<BTreeMap<String, i64>> {
        const OP: &str = "getTargetActionCount";

        let client = query.require(QueryField::ClientId)?;
        let target_type = query.require(QueryField::TargetType)?;
        query.require_some(&[QueryField::Target, QueryField::TargetOwner])?;

        let mut filter = Filter::new()
            .with(FieldPath::field(fields::CLIENT), filter_condition(client))
            .with(FieldPath::field(fields::TARGET_TYPE), filter_condition(target_type));
        if let Some(target) = query.get(QueryField::Target) {
            filter = filter.with(FieldPath::field(fields::TARGET), filter_condition(target));
        }
        for (field, path) in [
            (QueryField::TargetOwner, fields::OWNERS),
            (QueryField::TargetTags, fields::TAGS),
        ] {
            if let Some(value) = query.get(field) {
                filter = filter.with(FieldPath::field(path), Condition::Contains(value.values()));
            }
        }

        let bucket = self.counters_bucket().await.map_err(query_error(OP))?;
        let started = Instant::now();
        let docs = self
            .store
            .find(
                &bucket,
                &FindOptions::new(filter).project(vec![FieldPath::field(fields::ACTIONS)]),
            )
            .await
            .map_err(query_error(OP))?;
        log_fetch(OP, started.elapsed());

        let started = Instant::now();
        let mut result: BTreeMap<String, i64> = BTreeMap::new();
        for doc in &docs {
            if let Some(Value::Object(actions)) = doc.get(fields::ACTIONS) {
                for (action, counter) in actions {
                    *result.entry(action.clone()).or_default() += count_of(counter.get(fields::COUNT));
                }
            }
        }
        log_processed(OP, docs.len(), started.elapsed());

        Ok(result)
    }

    /// Monthly series per action for one target
    pub async fn get_target_stats(&self, query: &Query) -> Result<Vec<StatAction>> {
        const OP: &str = "getTargetStats";

        let client = query.require(QueryField::ClientId)?;
        let target_type = query.require(QueryField::TargetType)?;
        let target = query.require(QueryField::Target)?;

        let mut filter = Filter::new()
            .with(FieldPath::field(fields::CLIENT), filter_condition(client))
            .with(FieldPath::field(fields::TARGET_TYPE), filter_condition(target_type))
            .with(FieldPath::field(fields::TARGET), filter_condition(target))
            // Documents created by owner or tag upserts carry no action
            .exists(FieldPath::field(fields::ACTION));
        if let Some(action) = query.get(QueryField::Action) {
            filter = filter.with(FieldPath::field(fields::ACTION), filter_condition(action));
        }
        if let Some(condition) = date_condition(query)? {
            filter = filter.with(FieldPath::field(fields::DATE), condition);
        }

        let bucket = self.targets_bucket().await.map_err(query_error(OP))?;
        let started = Instant::now();
        let docs = self
            .store
            .find(
                &bucket,
                &FindOptions::new(filter).project(vec![
                    FieldPath::field(fields::ACTION),
                    FieldPath::field(fields::COUNT),
                    FieldPath::field(fields::DATE),
                ]),
            )
            .await
            .map_err(query_error(OP))?;
        log_fetch(OP, started.elapsed());

        let started = Instant::now();
        let mut actions: BTreeMap<String, (StatAction, BTreeMap<i64, StatCounter>)> = BTreeMap::new();
        for doc in &docs {
            let name = text_of(doc, fields::ACTION);
            let count = count_of(doc.get(fields::COUNT));
            let millis = doc.get(fields::DATE).and_then(Value::as_i64).unwrap_or(0);

            let (action, dates) = actions
                .entry(name.clone())
                .or_insert_with(|| (StatAction::new(name.clone(), 0), BTreeMap::new()));
            action.add(count);
            dates
                .entry(millis)
                .or_insert_with(|| StatCounter::dated(name.clone(), 0, from_millis(millis)))
                .add(count);
        }

        let result = actions
            .into_values()
            .map(|(mut action, dates)| {
                action.targets = dates.into_values().collect();
                action
            })
            .collect();
        log_processed(OP, docs.len(), started.elapsed());

        Ok(result)
    }
}

/// Parsed date bound, an error when the filter is set but not a date
fn date_bound(query: &Query, field: QueryField) -> Result<Option<DateTime<Utc>>> {
    let Some(filter) = query.get(field) else {
        return Ok(None);
    };
    filter.date_value().map(Some).ok_or_else(|| Error::InvalidFilter {
        field,
        reason: "expected an RFC 3339 timestamp or YYYY-MM-DD date".to_string(),
    })
}

/// Date range condition; bounds are swapped when reversed
fn date_condition(query: &Query) -> Result<Option<Condition>> {
    let from = date_bound(query, QueryField::DateFrom)?;
    let to = date_bound(query, QueryField::DateTo)?;
    Ok(match (from, to) {
        (None, None) => None,
        (Some(from), None) => Some(Condition::Gte(from.timestamp_millis().into())),
        (None, Some(to)) => Some(Condition::Lte(to.timestamp_millis().into())),
        (Some(from), Some(to)) => {
            let (from, to) = if to < from { (to, from) } else { (from, to) };
            Some(Condition::Range {
                gte: from.timestamp_millis().into(),
                lte: to.timestamp_millis().into(),
            })
        }
    })
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

fn log_fetch(operation: &str, elapsed: Duration) {
    if elapsed > SLOW_QUERY {
        tracing::warn!("{} query took {:.3}s", operation, elapsed.as_secs_f64());
    }
}

fn log_processed(operation: &str, processed: usize, elapsed: Duration) {
    if elapsed > SLOW_QUERY {
        tracing::warn!("{} fetch took {:.3}s", operation, elapsed.as_secs_f64());
    } else {
        tracing::info!(
            "{} processed {} results in {}ms",
            operation,
            processed,
            elapsed.as_millis()
        );
    }
}
