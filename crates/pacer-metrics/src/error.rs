//! Error types for the metrics engine

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("Metrics engine already finalized")]
    AlreadyFinalized,
}

pub type MetricsResult<T> = Result<T, MetricsError>;
