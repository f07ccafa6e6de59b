//! Pacer Upload Manager
//!
//! Durable hand-off of finalized artifacts to a remote object store:
//! - Tasks persisted as JSON next to their artifacts and reloaded on open
//! - Exponential backoff with jitter for retryable failures
//! - Dead-letter queue for exhausted or permanently rejected uploads
//! - Scheduler driven by retry deadlines and a connectivity signal
//! - HTTP `PUT` object store

pub mod backoff;
pub mod error;
pub mod http_store;
pub mod manager;
pub mod object_store;
pub mod retry_after;
pub mod scheduler;
pub mod task;
pub mod task_store;

pub use backoff::RetryPolicy;
pub use error::{PutError, UploadError, UploadResult};
pub use http_store::{HttpClientConfig, HttpObjectStore, create_client};
pub use manager::{SettlementListener, UploadManager};
pub use object_store::ObjectStore;
pub use scheduler::{SchedulerTask, spawn_scheduler};
pub use task::{
    AttemptOutcome, AttemptRecord, ResolveAction, TaskFilter, UploadRequest, UploadState,
    UploadTask,
};
pub use task_store::TaskStore;
