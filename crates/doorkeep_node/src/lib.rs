#![forbid(unsafe_code)]

pub mod backoff;
pub mod cloud;
pub mod config;
pub mod identity_registry;
pub mod ingestion;
pub mod reader;
pub mod sync_worker;

pub use cloud::{CloudApi, CloudError, CloudErrorClass, MemoryCloud, PostgrestCloudClient};
pub use identity_registry::IdentityRegistry;
pub use ingestion::{AccessOutcome, CardIntakeRequest, IngestError, IngestionService};
pub use sync_worker::{SyncStatusHandle, SyncWorker, SyncWorkerConfig, SyncWorkerCounters};
