pub mod cached;
pub mod document;
pub mod memory;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedStore;
pub use document::{
    escape_segment, Condition, Document, FieldPath, Filter, FindOptions, SortOrder, Update,
    ID_FIELD,
};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use trait_def::{
    validate_bucket_name, BucketHandle, DocumentStore, GroupReduce, IndexSpec, MapFn, ReduceFn,
    StorageError, StorageResult, UpdateOptions, UpdateOutcome,
};
