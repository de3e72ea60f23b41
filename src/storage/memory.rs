use crate::storage::document::{apply_find, check_unique, Document, Filter, FindOptions, Update, ID_FIELD};
use crate::storage::{
    validate_bucket_name, BucketHandle, DocumentStore, IndexSpec, StorageError, StorageResult,
    UpdateOptions, UpdateOutcome,
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MemoryBucket {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
    next_id: i64,
}

impl MemoryBucket {
    fn assign_id(&mut self, doc: &mut Document) {
        if !doc.contains_key(ID_FIELD) {
            self.next_id += 1;
            doc.insert(ID_FIELD.to_string(), Value::from(self.next_id));
        }
    }

    fn others(&self, skip: Option<usize>) -> impl Iterator<Item = &Document> + Clone {
        self.docs
            .iter()
            .enumerate()
            .filter(move |(i, _)| Some(*i) != skip)
            .map(|(_, doc)| doc)
    }
}

/// Process-local document store
///
/// Every bucket sits behind its own lock, so updates to one document are
/// atomic and buckets never block each other.
#[derive(Debug, Default)]
pub struct MemoryStore {
    buckets: DashMap<String, Arc<RwLock<MemoryBucket>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, bucket: &BucketHandle) -> Arc<RwLock<MemoryBucket>> {
        self.buckets
            .entry(bucket.name().to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn bucket(&self, name: &str) -> StorageResult<BucketHandle> {
        validate_bucket_name(name)?;
        self.buckets.entry(name.to_string()).or_default();
        Ok(BucketHandle::new(name))
    }

    async fn ensure_index(&self, bucket: &BucketHandle, index: &IndexSpec) -> StorageResult<()> {
        let bucket = self.get(bucket);
        let mut guard = bucket.write().await;
        if guard.indexes.iter().any(|existing| existing.name == index.name) {
            return Ok(());
        }
        // Existing documents must already satisfy a new unique index
        for (i, doc) in guard.docs.iter().enumerate() {
            check_unique(std::slice::from_ref(index), doc, guard.others(Some(i)))?;
        }
        guard.indexes.push(index.clone());
        Ok(())
    }

    async fn count(&self, bucket: &BucketHandle, filter: &Filter) -> StorageResult<u64> {
        let bucket = self.get(bucket);
        let guard = bucket.read().await;
        Ok(guard.docs.iter().filter(|doc| filter.matches(doc)).count() as u64)
    }

    async fn insert(&self, bucket: &BucketHandle, mut doc: Document) -> StorageResult<()> {
        let bucket = self.get(bucket);
        let mut guard = bucket.write().await;
        check_unique(&guard.indexes, &doc, guard.others(None))?;
        guard.assign_id(&mut doc);
        guard.docs.push(doc);
        Ok(())
    }

    async fn update(
        &self,
        bucket: &BucketHandle,
        filter: &Filter,
        update: &Update,
        options: UpdateOptions,
    ) -> StorageResult<UpdateOutcome> {
        let bucket = self.get(bucket);
        let mut guard = bucket.write().await;

        let targets: Vec<usize> = guard
            .docs
            .iter()
            .enumerate()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(i, _)| i)
            .take(if options.multi { usize::MAX } else { 1 })
            .collect();

        let mut outcome = UpdateOutcome::default();

        if targets.is_empty() {
            if !options.upsert {
                return Ok(outcome);
            }
            let mut doc = filter.seed()?;
            update.apply(&mut doc)?;
            check_unique(&guard.indexes, &doc, guard.others(None))?;
            guard.assign_id(&mut doc);
            guard.docs.push(doc);
            outcome.upserted = true;
            return Ok(outcome);
        }

        for i in targets {
            let mut candidate = guard.docs[i].clone();
            let changed = update.apply(&mut candidate)?;
            outcome.matched += 1;
            if !changed {
                continue;
            }
            check_unique(&guard.indexes, &candidate, guard.others(Some(i)))?;
            guard.docs[i] = candidate;
            outcome.modified += 1;
        }

        Ok(outcome)
    }

    async fn find(&self, bucket: &BucketHandle, options: &FindOptions) -> StorageResult<Vec<Document>> {
        let bucket = self.get(bucket);
        let guard = bucket.read().await;
        Ok(apply_find(&guard.docs, options))
    }

    async fn replace_all(&self, bucket: &BucketHandle, docs: Vec<Document>) -> StorageResult<()> {
        let bucket = self.get(bucket);
        let mut guard = bucket.write().await;
        guard.docs.clear();
        for mut doc in docs {
            check_unique(&guard.indexes, &doc, guard.others(None))?;
            guard.assign_id(&mut doc);
            guard.docs.push(doc);
        }
        Ok(())
    }

    async fn list_buckets(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.buckets.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn drop_all(&self) -> StorageResult<()> {
        self.buckets.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::document::FieldPath;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_then_increments() {
        let store = MemoryStore::new();
        let bucket = store.bucket("counters").await.unwrap();
        let filter = Filter::new()
            .eq(FieldPath::field("client"), "c")
            .eq(FieldPath::field("target"), "t");
        let update = Update::new().inc(FieldPath::field("count"), 1);

        let first = store
            .update(&bucket, &filter, &update, UpdateOptions::upsert())
            .await
            .unwrap();
        assert!(first.upserted);

        let second = store
            .update(&bucket, &filter, &update, UpdateOptions::upsert())
            .await
            .unwrap();
        assert_eq!(second.matched, 1);
        assert!(!second.upserted);

        let docs = store.find(&bucket, &FindOptions::new(filter)).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["count"], json!(2));
        assert_eq!(docs[0]["client"], json!("c"));
    }

    #[tokio::test]
    async fn test_unique_index_conflict() {
        let store = MemoryStore::new();
        let bucket = store.bucket("targets").await.unwrap();
        let index = IndexSpec::compound(
            "clientTarget",
            vec![FieldPath::field("client"), FieldPath::field("target")],
        )
        .unique();
        store.ensure_index(&bucket, &index).await.unwrap();

        store
            .insert(&bucket, doc(json!({"client": "c", "target": "t", "date": 1})))
            .await
            .unwrap();
        let err = store
            .insert(&bucket, doc(json!({"client": "c", "target": "t", "date": 2})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        // Documents without every indexed field are not constrained
        store.insert(&bucket, doc(json!({"client": "c"}))).await.unwrap();
        store.insert(&bucket, doc(json!({"client": "c"}))).await.unwrap();
        assert_eq!(store.count(&bucket, &Filter::new()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_multi_update_touches_every_match() {
        let store = MemoryStore::new();
        let bucket = store.bucket("counters").await.unwrap();
        for target in ["a", "b", "c"] {
            store
                .insert(&bucket, doc(json!({"client": "x", "target": target})))
                .await
                .unwrap();
        }
        let outcome = store
            .update(
                &bucket,
                &Filter::new().is_in(FieldPath::field("target"), ["a", "b"]),
                &Update::new().add_to_set(FieldPath::field("tags"), ["hot"]),
                UpdateOptions::upsert_multi(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.modified, 2);
        let tagged = store
            .count(&bucket, &Filter::new().contains(FieldPath::field("tags"), ["hot"]))
            .await
            .unwrap();
        assert_eq!(tagged, 2);
    }

    #[tokio::test]
    async fn test_invalid_bucket_name() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.bucket("bad-name").await,
            Err(StorageError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_all() {
        let store = MemoryStore::new();
        let bucket = store.bucket("events").await.unwrap();
        store.insert(&bucket, doc(json!({"a": 1}))).await.unwrap();
        assert_eq!(store.list_buckets().await.unwrap(), vec!["events".to_string()]);
        store.drop_all().await.unwrap();
        assert!(store.list_buckets().await.unwrap().is_empty());
    }
}
