pub mod config;
pub mod engine;
pub mod error;
pub mod models;
pub mod query;
pub mod scope;
pub mod storage;

pub use config::{EngineConfig, StoreBackend, StoreConfig};
pub use engine::{RollupReport, StatsEngine, Targets};
pub use error::{Error, Result};
pub use models::{Event, InvalidEventError, StatAction, StatCounter};
pub use query::{FilterValue, Query, QueryField, QueryFilter, QueryOp};
pub use scope::{bucket_name, TimeScope};
