use crate::storage::document::{Document, Filter, FindOptions, Update};
use crate::storage::{
    BucketHandle, DocumentStore, GroupReduce, IndexSpec, StorageResult, UpdateOptions,
    UpdateOutcome,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Store wrapper that remembers which buckets are already prepared
///
/// The first request for a bucket creates it and its indexes. Later requests
/// are answered from the handle cache without touching the backend.
pub struct CachedStore {
    /// Underlying store implementation
    inner: Arc<dyn DocumentStore>,
    /// Prepared bucket handles by name
    handles: DashMap<String, BucketHandle>,
}

impl CachedStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Self {
        Self {
            inner,
            handles: DashMap::new(),
        }
    }

    pub fn inner(&self) -> &Arc<dyn DocumentStore> {
        &self.inner
    }

    /// Whether a bucket has been prepared through this wrapper
    pub fn is_cached(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    /// Get a bucket, creating its indexes on first use
    ///
    /// Indexes are only created while the bucket is still empty. Buckets that
    /// already hold data are assumed to be indexed.
    pub async fn bucket_with_indexes(
        &self,
        name: &str,
        indexes: &[IndexSpec],
    ) -> StorageResult<BucketHandle> {
        if let Some(handle) = self.handles.get(name) {
            return Ok(handle.value().clone());
        }

        let handle = self.inner.bucket(name).await?;
        if !indexes.is_empty() && self.inner.count(&handle, &Filter::new()).await? == 0 {
            for index in indexes {
                self.inner.ensure_index(&handle, index).await?;
            }
            tracing::debug!("Created {} indexes on bucket {}", indexes.len(), name);
        }

        // Another task may have prepared the same bucket meanwhile
        let handle = self
            .handles
            .entry(name.to_string())
            .or_insert(handle)
            .value()
            .clone();
        Ok(handle)
    }

    /// Forget every cached handle
    pub fn clear(&self) {
        self.handles.clear();
    }
}

#[async_trait]
impl DocumentStore for CachedStore {
    async fn init(&self) -> StorageResult<()> {
        self.inner.init().await
    }

    async fn bucket(&self, name: &str) -> StorageResult<BucketHandle> {
        self.bucket_with_indexes(name, &[]).await
    }

    async fn ensure_index(&self, bucket: &BucketHandle, index: &IndexSpec) -> StorageResult<()> {
        self.inner.ensure_index(bucket, index).await
    }

    async fn count(&self, bucket: &BucketHandle, filter: &Filter) -> StorageResult<u64> {
        self.inner.count(bucket, filter).await
    }

    async fn insert(&self, bucket: &BucketHandle, doc: Document) -> StorageResult<()> {
        self.inner.insert(bucket, doc).await
    }

    async fn update(
        &self,
        bucket: &BucketHandle,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> StorageResult<UpdateOutcome> {
        self.inner.update(bucket, filter, update, options).await
    }

    async fn find(&self, bucket: &BucketHandle, options: &FindOptions) -> StorageResult<Vec<Document>> {
        self.inner.find(bucket, options).await
    }

    async fn replace_all(&self, bucket: &BucketHandle, docs: Vec<Document>) -> StorageResult<()> {
        self.inner.replace_all(bucket, docs).await
    }

    async fn list_buckets(&self) -> StorageResult<Vec<String>> {
        self.inner.list_buckets().await
    }

    async fn drop_all(&self) -> StorageResult<()> {
        self.inner.drop_all().await?;
        self.clear();
        Ok(())
    }

    async fn group_reduce(&self, source: &BucketHandle, job: &GroupReduce) -> StorageResult<u64> {
        self.inner.group_reduce(source, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::FieldPath;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_indexes_created_once_on_empty_bucket() {
        let inner: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let store = CachedStore::new(Arc::clone(&inner));
        let unique = IndexSpec::compound("client", vec![FieldPath::field("client")]).unique();

        assert!(!store.is_cached("actions"));
        let bucket = store
            .bucket_with_indexes("actions", std::slice::from_ref(&unique))
            .await
            .unwrap();
        assert!(store.is_cached("actions"));

        let doc = json!({"client": "c"}).as_object().cloned().unwrap();
        store.insert(&bucket, doc.clone()).await.unwrap();
        assert!(store.insert(&bucket, doc).await.is_err());
    }

    #[tokio::test]
    async fn test_non_empty_bucket_skips_indexes() {
        let inner: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let raw = inner.bucket("actions").await.unwrap();
        let doc = json!({"client": "c"}).as_object().cloned().unwrap();
        inner.insert(&raw, doc.clone()).await.unwrap();

        let store = CachedStore::new(inner);
        let unique = IndexSpec::compound("client", vec![FieldPath::field("client")]).unique();
        let bucket = store.bucket_with_indexes("actions", &[unique]).await.unwrap();
        store.insert(&bucket, doc).await.unwrap();
        assert_eq!(store.count(&bucket, &Filter::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_drop_all_clears_handles() {
        let store = CachedStore::new(Arc::new(MemoryStore::new()));
        store.bucket("events").await.unwrap();
        store.drop_all().await.unwrap();
        assert!(!store.is_cached("events"));
    }
}
