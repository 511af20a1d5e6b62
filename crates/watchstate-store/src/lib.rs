pub mod bucket;
pub mod db;
pub mod store;

pub use bucket::{BucketEntry, BUCKET_PROGRESS, BUCKET_REQUESTS, PROGRESS_TTL, REQUESTS_TTL};
pub use db::{open_pool, StoreConfig};
pub use store::{PageFilter, PageSort, StateStore, UpsertOutcome};
