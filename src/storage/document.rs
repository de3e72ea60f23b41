//! Document model shared by the store backends
//!
//! Documents are JSON objects. Filters, updates and projections address nested
//! fields through [`FieldPath`], a list of escaped segments, so user supplied
//! names (actions, metadata keys and values) can never inject extra nesting.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::storage::trait_def::{IndexSpec, StorageError, StorageResult};

pub type Document = Map<String, Value>;

/// Field every stored document is identified by
pub const ID_FIELD: &str = "_id";

/// Typed dotted path into a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path to a top-level field
    pub fn field(name: impl fmt::Display) -> Self {
        Self::new().push(name)
    }

    /// Append a segment
    ///
    /// Blank segments and lone dots are skipped, trailing dots are stripped and
    /// any remaining dot becomes `_`.
    pub fn push(mut self, segment: impl fmt::Display) -> Self {
        if let Some(segment) = escape_segment(&segment.to_string()) {
            self.segments.push(segment);
        }
        self
    }

    pub fn join(mut self, other: &FieldPath) -> Self {
        self.segments.extend(other.segments.iter().cloned());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

/// Make a value safe to use as a single structural key
pub fn escape_segment(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches('.');
    if trimmed.trim().is_empty() {
        return None;
    }
    Some(trimmed.replace('.', "_"))
}

pub fn get_path<'a>(doc: &'a Document, path: &FieldPath) -> Option<&'a Value> {
    let (first, rest) = path.segments().split_first()?;
    let mut current = doc.get(first)?;
    for segment in rest {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Walk to the parent object of `path`, creating intermediate objects
fn parent_mut<'a, 'p>(
    doc: &'a mut Document,
    path: &'p FieldPath,
) -> StorageResult<(&'a mut Document, &'p str)> {
    let (last, parents) = path
        .segments()
        .split_last()
        .ok_or_else(|| StorageError::InvalidUpdate("empty field path".to_string()))?;

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry.as_object_mut().ok_or_else(|| {
            StorageError::InvalidUpdate(format!("'{segment}' in '{path}' is not an object"))
        })?;
    }
    Ok((current, last.as_str()))
}

pub fn set_path(doc: &mut Document, path: &FieldPath, value: Value) -> StorageResult<()> {
    let (parent, key) = parent_mut(doc, path)?;
    parent.insert(key.to_string(), value);
    Ok(())
}

/// A single field condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    In(Vec<Value>),
    Gte(Value),
    Lte(Value),
    Range { gte: Value, lte: Value },
    Exists(bool),
    /// An array field holding any of the values, or a scalar equal to one
    Contains(Vec<Value>),
}

impl Condition {
    pub fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => eq_matches(field, expected),
            Condition::In(options) => options.iter().any(|expected| eq_matches(field, expected)),
            Condition::Contains(options) => match field {
                Some(Value::Array(items)) => items.iter().any(|item| options.contains(item)),
                Some(value) => options.contains(value),
                None => false,
            },
            Condition::Gte(bound) => cmp_matches(field, bound, |o| o != Ordering::Less),
            Condition::Lte(bound) => cmp_matches(field, bound, |o| o != Ordering::Greater),
            Condition::Range { gte, lte } => {
                cmp_matches(field, gte, |o| o != Ordering::Less)
                    && cmp_matches(field, lte, |o| o != Ordering::Greater)
            }
            Condition::Exists(wanted) => field.is_some() == *wanted,
        }
    }
}

fn eq_matches(field: Option<&Value>, expected: &Value) -> bool {
    match field {
        None => expected.is_null(),
        Some(value) => value == expected,
    }
}

fn cmp_matches(field: Option<&Value>, bound: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    let Some(value) = field else {
        return false;
    };
    match (value, bound) {
        (Value::Number(_), Value::Number(_)) | (Value::String(_), Value::String(_)) => {
            accept(compare_values(Some(value), Some(bound)))
        }
        _ => false,
    }
}

/// Conjunction of field conditions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(FieldPath, Condition)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: FieldPath, condition: Condition) -> Self {
        self.clauses.push((path, condition));
        self
    }

    pub fn eq(self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Eq(value.into()))
    }

    pub fn is_in<I, V>(self, path: FieldPath, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(path, Condition::In(values.into_iter().map(Into::into).collect()))
    }

    /// Element-wise membership for array fields such as owners and tags
    pub fn contains<I, V>(self, path: FieldPath, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.with(path, Condition::Contains(values.into_iter().map(Into::into).collect()))
    }

    pub fn exists(self, path: FieldPath) -> Self {
        self.with(path, Condition::Exists(true))
    }

    pub fn clauses(&self) -> &[(FieldPath, Condition)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(path, condition)| condition.matches(get_path(doc, path)))
    }

    /// Seed document for an upsert: every scalar equality clause becomes a field
    pub fn seed(&self) -> StorageResult<Document> {
        let mut doc = Document::new();
        for (path, condition) in &self.clauses {
            if let Condition::Eq(value) = condition {
                if !value.is_array() && !value.is_object() {
                    set_path(&mut doc, path, value.clone())?;
                }
            }
        }
        Ok(doc)
    }
}

/// Field update operations, applied in `$set`, `$inc`, `$addToSet` order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(FieldPath, Value)>,
    inc: Vec<(FieldPath, i64)>,
    add_to_set: Vec<(FieldPath, Vec<Value>)>,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: FieldPath, value: impl Into<Value>) -> Self {
        self.set.push((path, value.into()));
        self
    }

    pub fn inc(mut self, path: FieldPath, amount: i64) -> Self {
        self.inc.push((path, amount));
        self
    }

    pub fn add_to_set<I, V>(mut self, path: FieldPath, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.add_to_set
            .push((path, values.into_iter().map(Into::into).collect()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.inc.is_empty() && self.add_to_set.is_empty()
    }

    pub fn increments(&self) -> &[(FieldPath, i64)] {
        &self.inc
    }

    /// Apply to `doc`, returning whether anything changed
    pub fn apply(&self, doc: &mut Document) -> StorageResult<bool> {
        let before = doc.clone();

        for (path, value) in &self.set {
            set_path(doc, path, value.clone())?;
        }

        for (path, amount) in &self.inc {
            let (parent, key) = parent_mut(doc, path)?;
            let current = match parent.get(key) {
                None | Some(Value::Null) => 0,
                Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                    StorageError::InvalidUpdate(format!("'{path}' is not an integer"))
                })?,
                Some(_) => {
                    return Err(StorageError::InvalidUpdate(format!(
                        "cannot increment non-numeric '{path}'"
                    )))
                }
            };
            parent.insert(key.to_string(), Value::from(current + amount));
        }

        for (path, values) in &self.add_to_set {
            let (parent, key) = parent_mut(doc, path)?;
            let items = parent
                .entry(key.to_string())
                .or_insert_with(|| Value::Array(Vec::new()))
                .as_array_mut()
                .ok_or_else(|| StorageError::InvalidUpdate(format!("'{path}' is not an array")))?;
            for value in values {
                if !items.contains(value) {
                    items.push(value.clone());
                }
            }
        }

        Ok(*doc != before)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub filter: Filter,
    /// Top-level fields to keep (plus `_id`). Nested paths keep their root field.
    pub projection: Option<Vec<FieldPath>>,
    pub sort: Option<(FieldPath, SortOrder)>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn project(mut self, fields: Vec<FieldPath>) -> Self {
        self.projection = Some(fields);
        self
    }

    pub fn sort(mut self, path: FieldPath, order: SortOrder) -> Self {
        self.sort = Some((path, order));
        self
    }

    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Bool(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order over optional values: missing < null-equivalent < numbers < strings < the rest
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Evaluate find options over an in-memory set of documents
pub fn apply_find<'a, I>(docs: I, options: &FindOptions) -> Vec<Document>
where
    I: IntoIterator<Item = &'a Document>,
{
    let mut found: Vec<Document> = docs
        .into_iter()
        .filter(|doc| options.filter.matches(doc))
        .cloned()
        .collect();

    if let Some((path, order)) = &options.sort {
        found.sort_by(|a, b| {
            let ord = compare_values(get_path(a, path), get_path(b, path));
            match order {
                SortOrder::Ascending => ord,
                SortOrder::Descending => ord.reverse(),
            }
        });
    }

    if let Some(limit) = options.limit {
        found.truncate(limit);
    }

    if let Some(fields) = &options.projection {
        for doc in &mut found {
            doc.retain(|key, _| {
                key == ID_FIELD
                    || fields
                        .iter()
                        .any(|field| field.segments().first().map(String::as_str) == Some(key.as_str()))
            });
        }
    }

    found
}

/// Values of the indexed fields, or `None` when the document lacks any of them
pub fn index_key(doc: &Document, index: &IndexSpec) -> Option<Vec<Value>> {
    index
        .fields
        .iter()
        .map(|field| get_path(doc, field).cloned())
        .collect()
}

/// Check `candidate` against `others` for every unique index
pub fn check_unique<'a, I>(indexes: &[IndexSpec], candidate: &Document, others: I) -> StorageResult<()>
where
    I: IntoIterator<Item = &'a Document> + Clone,
{
    for index in indexes.iter().filter(|index| index.unique) {
        let Some(key) = index_key(candidate, index) else {
            continue;
        };
        let clash = others
            .clone()
            .into_iter()
            .any(|other| index_key(other, index).as_ref() == Some(&key));
        if clash {
            return Err(StorageError::Conflict {
                index: index.name.clone(),
            });
        }
    }
    Ok(())
}

/// Map every document, group emitted values by key and reduce each group
pub fn run_group_reduce(
    docs: &[Document],
    mapper: &dyn Fn(&Document, &mut dyn FnMut(Value, Value)),
    reducer: &dyn Fn(&Value, &[Value]) -> Value,
) -> Vec<Document> {
    // Keyed by the serialized key so equal JSON keys share a group
    let mut groups: BTreeMap<String, (Value, Vec<Value>)> = BTreeMap::new();
    for doc in docs {
        mapper(doc, &mut |key, value| {
            groups
                .entry(key.to_string())
                .or_insert_with(|| (key, Vec::new()))
                .1
                .push(value);
        });
    }

    groups
        .into_values()
        .map(|(key, mut values)| {
            let value = if values.len() == 1 {
                values.remove(0)
            } else {
                reducer(&key, &values)
            };
            let mut doc = Document::new();
            doc.insert(ID_FIELD.to_string(), key);
            doc.insert("value".to_string(), value);
            doc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_field_path_segments() {
        assert_eq!(FieldPath::field("a").to_string(), "a");
        assert_eq!(FieldPath::field("a").push("b").to_string(), "a.b");
        assert_eq!(FieldPath::field("a").push("b").push("c").to_string(), "a.b.c");
        assert_eq!(FieldPath::field("a").push("").push("c").to_string(), "a.c");
        assert_eq!(FieldPath::field(1).push(2).to_string(), "1.2");
        assert_eq!(FieldPath::field("a.").push("c").to_string(), "a.c");
        assert_eq!(FieldPath::field("a..").push("c.").to_string(), "a.c");
        assert_eq!(FieldPath::field("a").push(".").push("c").to_string(), "a.c");
        assert_eq!(FieldPath::field("192.168.1.5").segments(), ["192_168_1_5"]);
    }

    #[test]
    fn test_contains_matches_elementwise() {
        let d = doc(json!({"owners": ["a", "b"], "client": "c"}));
        let owners = FieldPath::field("owners");
        assert!(Filter::new().contains(owners.clone(), ["a"]).matches(&d));
        assert!(Filter::new().contains(owners.clone(), ["z", "b"]).matches(&d));
        assert!(!Filter::new().contains(owners.clone(), ["z"]).matches(&d));
        assert!(Filter::new().contains(FieldPath::field("client"), ["c"]).matches(&d));
        assert!(!Filter::new().contains(FieldPath::field("tags"), ["a"]).matches(&d));

        // Equality compares whole values
        assert!(!Filter::new().eq(owners.clone(), "a").matches(&d));
        assert!(Filter::new().eq(owners, json!(["a", "b"])).matches(&d));
        assert!(Filter::new().eq(FieldPath::field("client"), "c").matches(&d));
    }

    #[test]
    fn test_range_conditions() {
        let d = doc(json!({"date": 100}));
        let path = FieldPath::field("date");
        let range = |gte: i64, lte: i64| {
            Filter::new().with(
                path.clone(),
                Condition::Range {
                    gte: json!(gte),
                    lte: json!(lte),
                },
            )
        };
        assert!(range(100, 100).matches(&d));
        assert!(range(0, 200).matches(&d));
        assert!(!range(101, 200).matches(&d));
        assert!(!Filter::new()
            .with(path.clone(), Condition::Gte(json!(101)))
            .matches(&d));
        assert!(Filter::new()
            .with(path, Condition::Lte(json!(100)))
            .matches(&d));
    }

    #[test]
    fn test_update_nested_increments() {
        let mut d = Document::new();
        let update = Update::new()
            .inc(FieldPath::field("count"), 1)
            .inc(FieldPath::field("days").push(3).push("count"), 1)
            .add_to_set(FieldPath::field("owners"), ["a", "b"]);
        assert!(update.apply(&mut d).unwrap());
        assert!(update.apply(&mut d).unwrap());
        assert_eq!(
            Value::Object(d),
            json!({"count": 2, "days": {"3": {"count": 2}}, "owners": ["a", "b"]})
        );
    }

    #[test]
    fn test_update_rejects_path_through_scalar() {
        let mut d = doc(json!({"days": 5}));
        let update = Update::new().inc(FieldPath::field("days").push(1).push("count"), 1);
        assert!(matches!(update.apply(&mut d), Err(StorageError::InvalidUpdate(_))));
    }

    #[test]
    fn test_seed_skips_non_equality() {
        let filter = Filter::new()
            .eq(FieldPath::field("client"), "c")
            .is_in(FieldPath::field("target"), ["t1", "t2"]);
        let seed = filter.seed().unwrap();
        assert_eq!(Value::Object(seed), json!({"client": "c"}));
    }

    #[test]
    fn test_find_sort_limit_project() {
        let docs = vec![
            doc(json!({"_id": 1, "name": "a", "n": 3, "extra": true})),
            doc(json!({"_id": 2, "name": "b", "n": 7})),
            doc(json!({"_id": 3, "name": "c"})),
        ];
        let options = FindOptions::new(Filter::new())
            .sort(FieldPath::field("n"), SortOrder::Descending)
            .limit(Some(2))
            .project(vec![FieldPath::field("name")]);
        let found = apply_find(&docs, &options);
        assert_eq!(found.len(), 2);
        assert_eq!(Value::Object(found[0].clone()), json!({"_id": 2, "name": "b"}));
        assert_eq!(Value::Object(found[1].clone()), json!({"_id": 1, "name": "a"}));
    }

    #[test]
    fn test_group_reduce_sums() {
        let docs = vec![
            doc(json!({"k": "x", "n": 1})),
            doc(json!({"k": "x", "n": 2})),
            doc(json!({"k": "y", "n": 5})),
        ];
        let results = run_group_reduce(
            &docs,
            &|d: &Document, emit: &mut dyn FnMut(Value, Value)| {
                emit(d["k"].clone(), d["n"].clone());
            },
            &|_key: &Value, values: &[Value]| {
                Value::from(values.iter().filter_map(Value::as_i64).sum::<i64>())
            },
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["_id"], json!("x"));
        assert_eq!(results[0]["value"], json!(3));
        assert_eq!(results[1]["value"], json!(5));
    }
}
