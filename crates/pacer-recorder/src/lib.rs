//! Pacer Recording Orchestrator
//!
//! Ties the pipeline together for one recording at a time:
//! - Sensor ingress with per-metric filtering and a single ordered queue
//! - One consumer feeding the metrics engine, the session log and the encoder
//! - A session state machine with a strictly ordered stop sequence
//! - Replay of logs into summaries and artifacts after a crash
//! - A [`Pipeline`] facade owning the store, uploads and background tasks

mod consumer;
pub mod error;
pub mod ingress;
pub mod pipeline;
pub mod recorder;
pub mod replay;

pub use error::{Command, RecorderError, RecorderResult};
pub use ingress::{DropReason, Ingress, IngressStats};
pub use pipeline::Pipeline;
pub use recorder::{Recorder, StopReport};
pub use replay::{RebuiltSession, rebuild_artifact, session_end};
