use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::scope::TimeScope;

/// Environment variable prefix, e.g. `TALLY_PRECISION` or `TALLY_STORE__BACKEND`
pub const ENV_PREFIX: &str = "TALLY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub store: StoreConfig,
    /// Append every event to the raw event log
    pub keep_events: bool,
    /// Maintain the counter documents
    pub count_events: bool,
    /// Finest granularity recorded inside raw target counters
    pub precision: TimeScope,
    /// Drop every bucket when the engine starts
    pub reset_collections: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: String,
    /// Namespace prefixed to every table
    pub database: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "sqlite://./tally.db".to_string(),
            database: "tally".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            keep_events: true,
            count_events: true,
            precision: TimeScope::Daily,
            reset_collections: false,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the optional file, then `TALLY_*` environment variables
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: EngineConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tracing::debug!(
            "Loaded configuration: backend={:?} precision={} keep_events={} count_events={}",
            config.store.backend,
            config.precision,
            config.keep_events,
            config.count_events
        );

        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(None)
    }

    /// In-memory configuration with the given precision
    pub fn memory(precision: TimeScope) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.precision, TimeScope::Daily);
        assert!(config.keep_events);
        assert!(config.count_events);
        assert!(!config.reset_collections);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
precision = "hourly"
keep_events = false

[store]
backend = "sqlite"
url = "sqlite::memory:"
database = "stats"
max_connections = 2
"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.precision, TimeScope::Hourly);
        assert!(!config.keep_events);
        assert!(config.count_events);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.store.database, "stats");
        assert_eq!(config.store.max_connections, 2);
    }

    #[test]
    fn test_precision_accepts_short_key() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, r#"precision = "m""#).unwrap();
        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.precision, TimeScope::Monthly);
    }
}
