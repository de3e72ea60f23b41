//! The stats engine
//!
//! [`StatsEngine`] turns events into counter documents, answers the supported
//! query shapes and runs the rollup job. It owns its bucket cache, precision,
//! toggles and function registry, so several engines with different settings
//! can share one process.

pub mod counter;
pub mod fields;
pub mod ownership;
pub mod query;
pub mod rollup;

use std::sync::Arc;

use crate::config::{EngineConfig, StoreBackend};
use crate::error::{Error, Result};
use crate::scope::TimeScope;
use crate::storage::{
    BucketHandle, CachedStore, DocumentStore, FieldPath, IndexSpec, MemoryStore, SqliteStore,
    StorageResult,
};

pub use counter::meta_key_value;
pub use ownership::Targets;
pub use rollup::{FunctionRegistry, RollupReport};

/// Precisions raw target counters can be kept at
pub const SUPPORTED_PRECISIONS: [TimeScope; 3] =
    [TimeScope::Monthly, TimeScope::Daily, TimeScope::Hourly];

pub struct StatsEngine {
    store: CachedStore,
    precision: TimeScope,
    keep_events: bool,
    count_events: bool,
    functions: FunctionRegistry,
}

impl StatsEngine {
    /// Create an engine over an existing store
    pub async fn new(store: Arc<dyn DocumentStore>, config: &EngineConfig) -> Result<Self> {
        if !SUPPORTED_PRECISIONS.contains(&config.precision) {
            return Err(Error::UnsupportedPrecision(config.precision));
        }

        let store = CachedStore::new(store);
        store
            .init()
            .await
            .map_err(|e| Error::Engine(format!("Failed to initialize store: {e}")))?;

        if config.reset_collections {
            tracing::info!("Resetting all buckets");
            store.drop_all().await?;
        }

        tracing::info!(
            "Stats engine ready: precision={} keep_events={} count_events={}",
            config.precision,
            config.keep_events,
            config.count_events
        );

        Ok(Self {
            store,
            precision: config.precision,
            keep_events: config.keep_events,
            count_events: config.count_events,
            functions: FunctionRegistry::with_defaults(),
        })
    }

    /// Create the configured store and an engine over it
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let store: Arc<dyn DocumentStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => {
                tracing::info!("Opening SQLite store at {}", config.store.url);
                let store = SqliteStore::new(
                    &config.store.url,
                    &config.store.database,
                    config.store.max_connections,
                )
                .await
                .map_err(|e| Error::Engine(format!("Failed to open SQLite store: {e:#}")))?;
                Arc::new(store)
            }
        };
        Self::new(store, config).await
    }

    pub fn precision(&self) -> TimeScope {
        self.precision
    }

    pub fn supported_precisions(&self) -> &'static [TimeScope] {
        &SUPPORTED_PRECISIONS
    }

    pub fn keeps_events(&self) -> bool {
        self.keep_events
    }

    pub fn counts_events(&self) -> bool {
        self.count_events
    }

    pub fn store(&self) -> &CachedStore {
        &self.store
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Drop every bucket and forget cached handles
    pub async fn reset(&self) -> Result<()> {
        tracing::warn!("Dropping all buckets");
        self.store.drop_all().await?;
        Ok(())
    }

    pub(crate) async fn events_bucket(&self) -> StorageResult<BucketHandle> {
        let indexes = single_indexes(&[
            fields::CLIENT,
            fields::TARGET,
            fields::TARGET_TYPE,
            fields::DATE,
            fields::ACTION,
        ]);
        self.store
            .bucket_with_indexes(fields::EVENTS_BUCKET, &indexes)
            .await
    }

    pub(crate) async fn targets_bucket(&self) -> StorageResult<BucketHandle> {
        let mut indexes = single_indexes(&[
            fields::CLIENT,
            fields::TARGET,
            fields::TARGET_TYPE,
            fields::OWNERS,
            fields::TAGS,
            fields::ACTION,
            fields::DATE,
            fields::YEAR,
            fields::MONTH,
        ]);
        indexes.push(IndexSpec::compound(
            "targetYearMonth",
            target_key(&[fields::YEAR, fields::MONTH]),
        ));
        indexes.push(
            IndexSpec::compound(
                "targetActionYearMonth",
                target_key(&[fields::ACTION, fields::YEAR, fields::MONTH]),
            )
            .unique(),
        );
        indexes.push(
            IndexSpec::compound(
                "targetActionDate",
                target_key(&[fields::ACTION, fields::DATE]),
            )
            .unique(),
        );
        indexes.push(IndexSpec::compound("targetDate", target_key(&[fields::DATE])));
        self.store
            .bucket_with_indexes(fields::TARGETS_BUCKET, &indexes)
            .await
    }

    pub(crate) async fn counters_bucket(&self) -> StorageResult<BucketHandle> {
        let mut indexes = single_indexes(&[
            fields::CLIENT,
            fields::TARGET,
            fields::TARGET_TYPE,
            fields::OWNERS,
            fields::TAGS,
        ]);
        indexes.push(IndexSpec::compound("targetCounter", target_key(&[])).unique());
        self.store
            .bucket_with_indexes(fields::COUNTERS_BUCKET, &indexes)
            .await
    }

    pub(crate) async fn actions_bucket(&self) -> StorageResult<BucketHandle> {
        let mut indexes = single_indexes(&[fields::CLIENT, fields::ACTION]);
        indexes.push(
            IndexSpec::compound(
                "clientAction",
                vec![FieldPath::field(fields::CLIENT), FieldPath::field(fields::ACTION)],
            )
            .unique(),
        );
        self.store
            .bucket_with_indexes(fields::ACTIONS_BUCKET, &indexes)
            .await
    }
}

fn single_indexes(names: &[&str]) -> Vec<IndexSpec> {
    names
        .iter()
        .map(|name| IndexSpec::single(FieldPath::field(name)))
        .collect()
}

/// `client, target, target_type` followed by `extra`
fn target_key(extra: &[&str]) -> Vec<FieldPath> {
    [fields::CLIENT, fields::TARGET, fields::TARGET_TYPE]
        .iter()
        .chain(extra)
        .map(FieldPath::field)
        .collect()
}

/// Indexes kept on every rollup result bucket
pub(crate) fn stats_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::single(FieldPath::field(fields::VALUE).push(fields::COUNT)),
        IndexSpec::single(FieldPath::field(fields::VALUE).push(fields::UNIQUE)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejects_unsupported_precision() {
        for precision in [TimeScope::Weekly, TimeScope::Annual, TimeScope::Global] {
            let result = StatsEngine::new(
                Arc::new(MemoryStore::new()),
                &EngineConfig::memory(precision),
            )
            .await;
            assert!(matches!(result, Err(Error::UnsupportedPrecision(p)) if p == precision));
        }
    }

    #[tokio::test]
    async fn test_buckets_are_cached() {
        let engine = StatsEngine::connect(&EngineConfig::default()).await.unwrap();
        assert_eq!(engine.precision(), TimeScope::Daily);
        let first = engine.targets_bucket().await.unwrap();
        let second = engine.targets_bucket().await.unwrap();
        assert_eq!(first, second);
        assert!(engine.store().is_cached(fields::TARGETS_BUCKET));
    }
}
