//! Batch rollup of raw target counters into summary statistics
//!
//! A rollup runs one group-and-reduce pass over the raw target bucket. The
//! mapper decides the date granularity of the emitted keys, the reducer folds
//! the `{count, unique}` values of each key. Both are looked up by name in the
//! engine's [`FunctionRegistry`], so callers can swap or remove them.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::engine::fields;
use crate::engine::{stats_indexes, StatsEngine};
use crate::scope::{bucket_name, TimeScope};
use crate::storage::{Document, DocumentStore, Filter, GroupReduce, MapFn, ReduceFn, StorageResult};

pub const MAPPER_PREFIX: &str = "targetMapper";
pub const TARGET_REDUCER: &str = "targetReducer";
pub const PLAIN_REDUCER: &str = "plainReducer";

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;
const HOUR_MILLIS: i64 = 60 * 60 * 1000;

/// Named mapper and reducer functions available to rollups
pub struct FunctionRegistry {
    mappers: DashMap<String, MapFn>,
    reducers: DashMap<String, ReduceFn>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FunctionRegistry {
    /// Registry without any function
    pub fn empty() -> Self {
        Self {
            mappers: DashMap::new(),
            reducers: DashMap::new(),
        }
    }

    /// Registry holding the monthly, daily and hourly target mappers and both reducers
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register_mapper(Self::mapper_name(TimeScope::Monthly), Arc::new(map_monthly));
        registry.register_mapper(Self::mapper_name(TimeScope::Daily), Arc::new(map_daily));
        registry.register_mapper(Self::mapper_name(TimeScope::Hourly), Arc::new(map_hourly));
        registry.register_reducer(TARGET_REDUCER, Arc::new(reduce_target));
        registry.register_reducer(PLAIN_REDUCER, Arc::new(reduce_plain));
        registry
    }

    /// `targetMapper` followed by the upper-cased scope key, e.g. `targetMapperD`
    pub fn mapper_name(scope: TimeScope) -> String {
        format!("{}{}", MAPPER_PREFIX, scope.key().to_uppercase())
    }

    pub fn register_mapper(&self, name: impl Into<String>, mapper: MapFn) {
        self.mappers.insert(name.into(), mapper);
    }

    pub fn register_reducer(&self, name: impl Into<String>, reducer: ReduceFn) {
        self.reducers.insert(name.into(), reducer);
    }

    /// Remove a mapper or reducer, returning whether one existed
    pub fn remove(&self, name: &str) -> bool {
        let mapper = self.mappers.remove(name).is_some();
        let reducer = self.reducers.remove(name).is_some();
        mapper || reducer
    }

    pub fn mapper(&self, name: &str) -> Option<MapFn> {
        self.mappers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn reducer(&self, name: &str) -> Option<ReduceFn> {
        self.reducers.get(name).map(|entry| Arc::clone(entry.value()))
    }
}

/// Outcome of a rollup run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub mapper: String,
    pub result_bucket: String,
    /// Number of summary documents written, 0 when the run was skipped or failed
    pub groups: u64,
}

impl StatsEngine {
    /// Roll raw target counters up into a stats bucket
    ///
    /// `group_by` selects the mapper granularity. It falls back to the engine
    /// precision when absent or broader than monthly. `result_scope` selects
    /// the result bucket. Failures are logged and reported as zero groups.
    pub async fn build_stats(
        &self,
        result_scope: Option<TimeScope>,
        group_by: Option<TimeScope>,
    ) -> RollupReport {
        let mapper_scope = match group_by {
            None | Some(TimeScope::Global | TimeScope::Annual | TimeScope::Weekly) => self.precision,
            Some(scope) => scope,
        };

        let mut report = RollupReport {
            mapper: FunctionRegistry::mapper_name(mapper_scope),
            result_bucket: bucket_name(fields::STATS_PREFIX, &Utc::now(), result_scope),
            groups: 0,
        };

        let Some(mapper) = self.functions.mapper(&report.mapper) else {
            tracing::error!("Rollup skipped: mapper {} is not registered", report.mapper);
            return report;
        };
        let Some(reducer) = self.functions.reducer(TARGET_REDUCER) else {
            tracing::error!("Rollup skipped: reducer {} is not registered", TARGET_REDUCER);
            return report;
        };

        match self.run_rollup(&report.result_bucket, mapper, reducer).await {
            Ok(groups) => {
                tracing::info!(
                    "Rolled up targets with {} into {}: {} groups",
                    report.mapper,
                    report.result_bucket,
                    groups
                );
                report.groups = groups;
            }
            Err(e) => tracing::error!("Map reducing targets into {}: {}", report.result_bucket, e),
        }

        report
    }

    async fn run_rollup(&self, result_bucket: &str, mapper: MapFn, reducer: ReduceFn) -> StorageResult<u64> {
        let source = self.targets_bucket().await?;
        let output = self.store.bucket(result_bucket).await?;
        let job = GroupReduce {
            filter: Filter::new(),
            mapper,
            reducer,
            output: output.clone(),
        };

        let groups = self.store.group_reduce(&source, &job).await?;
        if groups > 0 {
            for index in stats_indexes() {
                self.store.ensure_index(&output, &index).await?;
            }
        }
        Ok(groups)
    }
}

/// Summary key shared by all target mappers
fn emit_key(doc: &Document, date: i64) -> Value {
    json!({
        fields::CLIENT: doc.get(fields::CLIENT).cloned().unwrap_or(Value::Null),
        fields::ACTION: doc.get(fields::ACTION).cloned().unwrap_or(Value::Null),
        fields::TARGET_TYPE: doc.get(fields::TARGET_TYPE).cloned().unwrap_or(Value::Null),
        fields::TARGET: doc.get(fields::TARGET).cloned().unwrap_or(Value::Null),
        fields::OWNERS: doc.get(fields::OWNERS).cloned().unwrap_or_else(|| json!([])),
        fields::TAGS: doc.get(fields::TAGS).cloned().unwrap_or_else(|| json!([])),
        fields::DATE: date,
    })
}

fn count_value(node: &Document) -> i64 {
    node.get(fields::COUNT).and_then(Value::as_i64).unwrap_or(0)
}

/// Distinct `ip` metadata values recorded at `node` or below it
fn collect_ips(node: &Document, into: &mut BTreeSet<String>) {
    if let Some(Value::Object(ips)) = node
        .get(fields::META)
        .and_then(|meta| meta.get(fields::META_IP))
    {
        into.extend(ips.keys().cloned());
    }
    for nested in [fields::DAYS, fields::HOURS] {
        if let Some(Value::Object(children)) = node.get(nested) {
            for child in children.values().filter_map(Value::as_object) {
                collect_ips(child, into);
            }
        }
    }
}

fn emit_level(doc: &Document, node: &Document, date: i64, emit: &mut dyn FnMut(Value, Value)) {
    let mut ips = BTreeSet::new();
    collect_ips(node, &mut ips);
    emit(
        emit_key(doc, date),
        json!({ fields::COUNT: count_value(node), fields::UNIQUE: ips.len() }),
    );
}

/// Numbered children of `node.<field>` in numeric order
fn numbered_children<'a>(node: &'a Document, field: &str) -> Vec<(i64, &'a Document)> {
    let mut children: Vec<(i64, &Document)> = match node.get(field) {
        Some(Value::Object(children)) => children
            .iter()
            .filter_map(|(key, child)| Some((key.parse().ok()?, child.as_object()?)))
            .collect(),
        _ => Vec::new(),
    };
    children.sort_by_key(|(number, _)| *number);
    children
}

fn month_date(doc: &Document) -> i64 {
    doc.get(fields::DATE).and_then(Value::as_i64).unwrap_or(0)
}

pub(crate) fn map_monthly(doc: &Document, emit: &mut dyn FnMut(Value, Value)) {
    emit_level(doc, doc, month_date(doc), emit);
}

pub(crate) fn map_daily(doc: &Document, emit: &mut dyn FnMut(Value, Value)) {
    let days = numbered_children(doc, fields::DAYS);
    if days.is_empty() {
        return map_monthly(doc, emit);
    }
    for (day, node) in days {
        emit_level(doc, node, month_date(doc) + (day - 1) * DAY_MILLIS, emit);
    }
}

pub(crate) fn map_hourly(doc: &Document, emit: &mut dyn FnMut(Value, Value)) {
    let days = numbered_children(doc, fields::DAYS);
    if days.is_empty() {
        return map_monthly(doc, emit);
    }
    for (day, day_node) in days {
        let day_date = month_date(doc) + (day - 1) * DAY_MILLIS;
        let hours = numbered_children(day_node, fields::HOURS);
        if hours.is_empty() {
            emit_level(doc, day_node, day_date, emit);
            continue;
        }
        for (hour, node) in hours {
            emit_level(doc, node, day_date + hour * HOUR_MILLIS, emit);
        }
    }
}

fn sum_field(values: &[Value], field: &str) -> i64 {
    values
        .iter()
        .filter_map(|value| value.get(field).and_then(Value::as_i64))
        .sum()
}

pub(crate) fn reduce_target(_key: &Value, values: &[Value]) -> Value {
    json!({
        fields::COUNT: sum_field(values, fields::COUNT),
        fields::UNIQUE: sum_field(values, fields::UNIQUE),
    })
}

pub(crate) fn reduce_plain(_key: &Value, values: &[Value]) -> Value {
    json!({ fields::COUNT: sum_field(values, fields::COUNT) })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARCH_2011: i64 = 1298937600000;

    fn raw_doc() -> Document {
        json!({
            "client": "c",
            "action": "view",
            "target_type": "page",
            "target": "t",
            "owners": ["o"],
            "date": MARCH_2011,
            "count": 3,
            "days": {
                "2": {
                    "count": 2,
                    "hours": {
                        "5": {"count": 1, "meta": {"ip": {"1": 1}}},
                        "7": {"count": 1, "meta": {"ip": {"2": 1}}}
                    }
                },
                "10": {"count": 1, "hours": {"0": {"count": 1, "meta": {"ip": {"1": 1}}}}}
            }
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn run(mapper: fn(&Document, &mut dyn FnMut(Value, Value)), doc: &Document) -> Vec<(Value, Value)> {
        let mut emitted = Vec::new();
        mapper(doc, &mut |key, value| emitted.push((key, value)));
        emitted
    }

    #[test]
    fn test_mapper_names() {
        assert_eq!(FunctionRegistry::mapper_name(TimeScope::Monthly), "targetMapperM");
        assert_eq!(FunctionRegistry::mapper_name(TimeScope::Daily), "targetMapperD");
        assert_eq!(FunctionRegistry::mapper_name(TimeScope::Hourly), "targetMapperH");
    }

    #[test]
    fn test_monthly_mapper() {
        let emitted = run(map_monthly, &raw_doc());
        assert_eq!(emitted.len(), 1);
        let (key, value) = &emitted[0];
        assert_eq!(key["date"], json!(MARCH_2011));
        assert_eq!(key["owners"], json!(["o"]));
        assert_eq!(key["tags"], json!([]));
        assert_eq!(value, &json!({"count": 3, "unique": 2}));
    }

    #[test]
    fn test_daily_mapper() {
        let emitted = run(map_daily, &raw_doc());
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].0["date"], json!(MARCH_2011 + DAY_MILLIS));
        assert_eq!(emitted[0].1, json!({"count": 2, "unique": 2}));
        assert_eq!(emitted[1].0["date"], json!(MARCH_2011 + 9 * DAY_MILLIS));
        assert_eq!(emitted[1].1, json!({"count": 1, "unique": 1}));
    }

    #[test]
    fn test_hourly_mapper() {
        let emitted = run(map_hourly, &raw_doc());
        assert_eq!(emitted.len(), 3);
        assert_eq!(
            emitted[0].0["date"],
            json!(MARCH_2011 + DAY_MILLIS + 5 * HOUR_MILLIS)
        );
        assert!(emitted.iter().all(|(_, value)| value["unique"] == json!(1)));
    }

    #[test]
    fn test_mappers_fall_back_to_coarser_levels() {
        let mut doc = raw_doc();
        doc.remove("days");
        assert_eq!(run(map_daily, &doc).len(), 1);
        assert_eq!(run(map_hourly, &doc).len(), 1);
    }

    #[test]
    fn test_reducers() {
        let values = vec![json!({"count": 2, "unique": 1}), json!({"count": 3, "unique": 0})];
        assert_eq!(reduce_target(&Value::Null, &values), json!({"count": 5, "unique": 1}));
        assert_eq!(reduce_plain(&Value::Null, &values), json!({"count": 5}));
    }

    #[test]
    fn test_registry_remove() {
        let registry = FunctionRegistry::with_defaults();
        assert!(registry.mapper("targetMapperD").is_some());
        assert!(registry.remove("targetMapperD"));
        assert!(!registry.remove("targetMapperD"));
        assert!(registry.mapper("targetMapperD").is_none());
        assert!(registry.reducer(TARGET_REDUCER).is_some());
    }
}
