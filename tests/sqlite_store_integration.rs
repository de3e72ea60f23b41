//! Integration tests for the SQLite document store

use serde_json::json;
use std::sync::Arc;
use tally::storage::{
    Document, DocumentStore, FieldPath, Filter, FindOptions, IndexSpec, SortOrder, SqliteStore,
    StorageError, Update, UpdateOptions,
};
use tally::{EngineConfig, Event, Query, QueryField, StatsEngine, StoreBackend, TimeScope};

fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap()
}

async fn create_store() -> Arc<dyn DocumentStore> {
    let store = SqliteStore::new("sqlite::memory:", "test", 1).await.unwrap();
    store.init().await.unwrap();
    Arc::new(store)
}

#[tokio::test]
async fn test_upsert_and_increment() {
    let store = create_store().await;
    let bucket = store.bucket("counters").await.unwrap();
    let filter = Filter::new()
        .eq(FieldPath::field("client"), "c")
        .eq(FieldPath::field("target"), "t");
    let update = Update::new()
        .inc(FieldPath::field("actions").push("view").push("count"), 1)
        .add_to_set(FieldPath::field("owners"), ["a"]);

    for _ in 0..3 {
        store
            .update(&bucket, &filter, &update, UpdateOptions::upsert())
            .await
            .unwrap();
    }

    let docs = store.find(&bucket, &FindOptions::new(filter)).await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["actions"]["view"]["count"], json!(3));
    assert_eq!(docs[0]["owners"], json!(["a"]));
}

#[tokio::test]
async fn test_update_without_upsert_leaves_bucket_empty() {
    let store = create_store().await;
    let bucket = store.bucket("counters").await.unwrap();
    let outcome = store
        .update(
            &bucket,
            &Filter::new().eq(FieldPath::field("client"), "c"),
            &Update::new().inc(FieldPath::field("count"), 1),
            UpdateOptions::default(),
        )
        .await
        .unwrap();
    assert!(!outcome.affected());
    assert_eq!(store.count(&bucket, &Filter::new()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unique_compound_index() {
    let store = create_store().await;
    let bucket = store.bucket("actions").await.unwrap();
    let index = IndexSpec::compound(
        "clientAction",
        vec![FieldPath::field("client"), FieldPath::field("action")],
    )
    .unique();
    store.ensure_index(&bucket, &index).await.unwrap();

    store
        .insert(&bucket, doc(json!({"client": "c", "action": "view"})))
        .await
        .unwrap();
    store
        .insert(&bucket, doc(json!({"client": "c", "action": "like"})))
        .await
        .unwrap();
    let err = store
        .insert(&bucket, doc(json!({"client": "c", "action": "view"})))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict { .. }));

    // Documents lacking an indexed field are not constrained
    store.insert(&bucket, doc(json!({"client": "c"}))).await.unwrap();
    store.insert(&bucket, doc(json!({"client": "c"}))).await.unwrap();
}

#[tokio::test]
async fn test_find_sort_and_limit() {
    let store = create_store().await;
    let bucket = store.bucket("counters").await.unwrap();
    for (target, count) in [("a", 5), ("b", 9), ("c", 1)] {
        store
            .insert(&bucket, doc(json!({"target": target, "count": count})))
            .await
            .unwrap();
    }

    let options = FindOptions::new(Filter::new())
        .sort(FieldPath::field("count"), SortOrder::Descending)
        .limit(Some(2));
    let docs = store.find(&bucket, &options).await.unwrap();
    let targets: Vec<_> = docs.iter().map(|d| d["target"].clone()).collect();
    assert_eq!(targets, vec![json!("b"), json!("a")]);
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("tally.db").display());

    let first = SqliteStore::new(&url, "one", 1).await.unwrap();
    first.init().await.unwrap();
    let second = SqliteStore::new(&url, "two", 1).await.unwrap();
    second.init().await.unwrap();

    let bucket = first.bucket("events").await.unwrap();
    first.insert(&bucket, doc(json!({"a": 1}))).await.unwrap();

    assert_eq!(first.list_buckets().await.unwrap(), vec!["events".to_string()]);
    assert!(second.list_buckets().await.unwrap().is_empty());

    second.drop_all().await.unwrap();
    assert_eq!(first.count(&bucket, &Filter::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_counters_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::memory(TimeScope::Daily);
    config.store.backend = StoreBackend::Sqlite;
    config.store.url = format!("sqlite://{}", dir.path().join("stats.db").display());
    config.store.max_connections = 1;

    {
        let engine = StatsEngine::connect(&config).await.unwrap();
        engine
            .handle_event(&Event::new("c", "t", "page", "view"))
            .await
            .unwrap();
    }

    let engine = StatsEngine::connect(&config).await.unwrap();
    engine
        .handle_event(&Event::new("c", "t", "page", "view"))
        .await
        .unwrap();
    let actions = engine
        .get_actions(&Query::new().filter_by(QueryField::ClientId, "c"))
        .await
        .unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].count, 2);
}

#[tokio::test]
async fn test_invalid_bucket_name_rejected() {
    let store = create_store().await;
    assert!(matches!(
        store.bucket("drop table").await,
        Err(StorageError::InvalidName(_))
    ));
}
