//! Pacer Durable Session Log
//!
//! Crash-safe, append-only storage for session entries:
//! - Chunked log files with SHA-256 framing, written atomically
//! - Checkpoints that mark the highest durable chunk
//! - Background flushing with bounded retry and a degraded in-memory mode
//! - Startup recovery and orphan cleanup
//! - Quota enforcement across logs and upload artifacts

pub mod atomic_writer;
pub mod checkpoint;
pub mod chunk_file;
pub mod error;
pub mod file_lock;
pub mod layout;
pub mod quota;
pub mod recovery;
pub mod session_log;
pub mod sink;
pub mod store;

pub use atomic_writer::write_atomic;
pub use error::{StorageError, StorageResult};
pub use quota::{QuotaStats, QuotaTask, RetentionIndex, dir_size, spawn_quota_task};
pub use recovery::{CorruptLog, OrphanReason, OrphanedLog, RecoveredSession, RecoveryReport};
pub use session_log::{
    ActiveGuard, FinalFlushReport, FlushPolicy, LogMode, LogStatus, ResumePoint, SessionLog,
};
pub use sink::{ChunkSink, FsChunkSink};
pub use store::{DurableLogStore, LogSummary};
