use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::storage::document::{run_group_reduce, Document, FieldPath, Filter, FindOptions, Update};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("duplicate key for unique index {index}")]
    Conflict { index: String },
    #[error("invalid bucket name '{0}'")]
    InvalidName(String),
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Handle to a named bucket (one logical collection)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketHandle {
    name: Arc<str>,
}

impl BucketHandle {
    pub fn new(name: &str) -> Self {
        Self { name: Arc::from(name) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for BucketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Bucket names double as table names, so keep them to `[A-Za-z0-9_]`.
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Secondary index definition
///
/// A unique index only constrains documents carrying every indexed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<FieldPath>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn single(field: FieldPath) -> Self {
        Self {
            name: field.to_string(),
            fields: vec![field],
            unique: false,
        }
    }

    pub fn compound(name: impl Into<String>, fields: Vec<FieldPath>) -> Self {
        Self {
            name: name.into(),
            fields,
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Create a document seeded from the filter when nothing matches
    pub upsert: bool,
    /// Apply to every matching document instead of the first
    pub multi: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self {
            upsert: true,
            multi: false,
        }
    }

    pub fn upsert_multi() -> Self {
        Self {
            upsert: true,
            multi: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
}

impl UpdateOutcome {
    /// Whether the update touched any document, existing or new
    pub fn affected(&self) -> bool {
        self.matched > 0 || self.upserted
    }
}

/// Emits `(key, value)` pairs for one source document
pub type MapFn = Arc<dyn Fn(&Document, &mut dyn FnMut(Value, Value)) + Send + Sync>;

/// Folds all values emitted for one key into a single value
pub type ReduceFn = Arc<dyn Fn(&Value, &[Value]) -> Value + Send + Sync>;

/// A group-and-reduce pass over one bucket
///
/// The output bucket is replaced with one `{_id: key, value}` document per key.
#[derive(Clone)]
pub struct GroupReduce {
    pub filter: Filter,
    pub mapper: MapFn,
    pub reducer: ReduceFn,
    pub output: BucketHandle,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Initialize the store (registry tables, etc.)
    async fn init(&self) -> StorageResult<()>;

    /// Get or create a bucket. Idempotent.
    async fn bucket(&self, name: &str) -> StorageResult<BucketHandle>;

    /// Create an index unless one with the same name exists
    async fn ensure_index(&self, bucket: &BucketHandle, index: &IndexSpec) -> StorageResult<()>;

    /// Count documents matching the filter
    async fn count(&self, bucket: &BucketHandle, filter: &Filter) -> StorageResult<u64>;

    /// Append a document
    async fn insert(&self, bucket: &BucketHandle, doc: Document) -> StorageResult<()>;

    /// Apply `$set`, `$inc` and `$addToSet` operations atomically per document
    async fn update(
        &self,
        bucket: &BucketHandle,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> StorageResult<UpdateOutcome>;

    /// Filter, sort, limit and project documents
    async fn find(&self, bucket: &BucketHandle, options: &FindOptions) -> StorageResult<Vec<Document>>;

    /// Replace the bucket contents
    async fn replace_all(&self, bucket: &BucketHandle, docs: Vec<Document>) -> StorageResult<()>;

    /// List known bucket names
    async fn list_buckets(&self) -> StorageResult<Vec<String>>;

    /// Drop every bucket (administrative reset)
    async fn drop_all(&self) -> StorageResult<()>;

    /// Run a group-and-reduce pass, returning the number of groups written
    async fn group_reduce(&self, source: &BucketHandle, job: &GroupReduce) -> StorageResult<u64> {
        let docs = self
            .find(source, &FindOptions::new(job.filter.clone()))
            .await?;
        let results = run_group_reduce(&docs, job.mapper.as_ref(), job.reducer.as_ref());
        let groups = results.len() as u64;
        self.replace_all(&job.output, results).await?;
        Ok(groups)
    }
}
