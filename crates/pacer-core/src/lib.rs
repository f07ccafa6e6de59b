//! Pacer Core Types
//!
//! This crate provides the types shared by every stage of the recording pipeline:
//! - Sensor readings and the closed set of metrics
//! - Sessions, manifests and profile snapshots
//! - Log entries, chunks and checkpoints
//! - Pipeline configuration
//! - Core error types

pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod log;
pub mod reading;
pub mod session;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigFormat, EncoderConfig, IngressConfig, LogConfig, LoggingConfig, MetricsConfig,
    PipelineConfig, QuotaConfig, Sport, UploadConfig,
};
pub use error::{Error, InvalidReading, Result};
pub use log::{Checkpoint, Chunk, LogEntry, TimerAction, TimerEvent};
pub use reading::{GeoPoint, MetricKind, MetricValue, MonotonicMs, Reading};
pub use session::{
    ClockOrigin, ProfileProvider, ProfileSnapshot, Session, SessionId, SessionManifest,
    SessionState,
};
