//! Pacer Metrics Engine
//!
//! Derives live and final session metrics from the ordered stream of log
//! entries. The engine is a pure projection: feeding the same entries to a
//! fresh engine always yields the same snapshot.
//!
//! - Per-metric count, average and maximum with exact last-write-wins
//! - 30 second rolling power and Normalized Power over a 1 Hz resample
//! - Time in power and heart-rate zones
//! - Intensity factor and training stress score

pub mod engine;
pub mod error;
pub mod rolling;
pub mod snapshot;
pub mod track;
pub mod zones;

pub use engine::{MetricsEngine, replay};
pub use error::{MetricsError, MetricsResult};
pub use snapshot::{IntensityBasis, LiveMetrics, MetricSummary, MetricsSnapshot};
pub use zones::ZoneTable;
