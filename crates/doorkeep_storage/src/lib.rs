#![forbid(unsafe_code)]

pub mod repo;
pub mod store;

pub use repo::EdgeStoreRepo;
pub use store::{LocalStore, OutboxCounters, PermissionUpsertOutcome, StorageError};
