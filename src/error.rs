use thiserror::Error;

use crate::models::InvalidEventError;
use crate::query::QueryField;
use crate::scope::TimeScope;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] InvalidEventError),

    #[error("duplicate event: {event}")]
    DuplicateEvent { event: String },

    #[error("required query field missing: {0}")]
    RequiredField(QueryField),

    #[error("one of the query fields {} is required", join_fields(.0))]
    SomeRequiredField(Vec<QueryField>),

    #[error("invalid value for query field {field}: {reason}")]
    InvalidFilter { field: QueryField, reason: String },

    #[error("query '{operation}' failed: {source}")]
    QueryExecution {
        operation: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("unsupported precision '{0}', expected monthly, daily or hourly")]
    UnsupportedPrecision(TimeScope),

    #[error("{0}")]
    Engine(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, Error>;

fn join_fields(fields: &[QueryField]) -> String {
    fields
        .iter()
        .map(|field| field.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
