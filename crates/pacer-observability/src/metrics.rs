//! Metrics collection with Prometheus
//!
//! This module provides Prometheus metrics for the recording pipeline:
//! - Readings accepted and dropped (by metric / drop reason)
//! - Chunk flushes, retries, failures and degraded logs
//! - Encoded artifacts and their sizes
//! - Upload attempts by outcome, latency, dead letters and task gauges
//! - Bytes freed by quota enforcement

use prometheus::{
    Counter, CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector for one pipeline instance
#[derive(Clone)]
pub struct PipelineMetrics {
    /// Prometheus registry
    registry: Arc<Registry>,

    // Ingress
    /// Readings accepted into the ingestion queue
    pub readings_accepted_total: CounterVec,
    /// Readings dropped before the queue
    pub readings_dropped_total: CounterVec,

    // Durable log
    /// Chunks written durably
    pub chunks_flushed_total: Counter,
    /// Flush attempts that were retried
    pub flush_retries_total: Counter,
    /// Chunks that exhausted their flush attempts
    pub flush_failures_total: Counter,
    /// Logs that fell back to in-memory mode
    pub log_degraded_total: Counter,
    /// Chunk + checkpoint write latency
    pub flush_duration_seconds: Histogram,

    // Encoder
    pub artifacts_encoded_total: Counter,
    pub artifact_bytes: Histogram,

    // Upload
    /// Upload attempts (outcome = success, retryable, permanent, corrupt)
    pub upload_attempts_total: CounterVec,
    pub upload_duration_seconds: HistogramVec,
    /// Current task count by state
    pub upload_tasks: GaugeVec,
    pub dead_letter_total: Counter,

    // Quota
    pub quota_bytes_freed_total: Counter,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let readings_accepted_total = CounterVec::new(
            Opts::new(
                "pacer_readings_accepted_total",
                "Readings accepted into the ingestion queue",
            ),
            &["metric"],
        )?;

        let readings_dropped_total = CounterVec::new(
            Opts::new(
                "pacer_readings_dropped_total",
                "Readings dropped by sensor ingress",
            ),
            &["reason"],
        )?;

        let chunks_flushed_total = Counter::with_opts(Opts::new(
            "pacer_chunks_flushed_total",
            "Chunks written durably",
        ))?;

        let flush_retries_total = Counter::with_opts(Opts::new(
            "pacer_flush_retries_total",
            "Chunk flush attempts that were retried",
        ))?;

        let flush_failures_total = Counter::with_opts(Opts::new(
            "pacer_flush_failures_total",
            "Chunks that exhausted their flush attempts",
        ))?;

        let log_degraded_total = Counter::with_opts(Opts::new(
            "pacer_log_degraded_total",
            "Session logs degraded to in-memory mode",
        ))?;

        let flush_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "pacer_flush_duration_seconds",
                "Chunk flush duration in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        )?;

        let artifacts_encoded_total = Counter::with_opts(Opts::new(
            "pacer_artifacts_encoded_total",
            "Session artifacts finalized by the encoder",
        ))?;

        let artifact_bytes = Histogram::with_opts(
            HistogramOpts::new("pacer_artifact_bytes", "Size of finalized artifacts").buckets(
                vec![
                    1_024.0,
                    16_384.0,
                    65_536.0,
                    262_144.0,
                    1_048_576.0,
                    4_194_304.0,
                    16_777_216.0,
                ],
            ),
        )?;

        let upload_attempts_total = CounterVec::new(
            Opts::new("pacer_upload_attempts_total", "Upload attempts by outcome"),
            &["outcome"],
        )?;

        let upload_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pacer_upload_duration_seconds",
                "Upload attempt duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["outcome"],
        )?;

        let upload_tasks = GaugeVec::new(
            Opts::new("pacer_upload_tasks", "Upload tasks by state"),
            &["state"],
        )?;

        let dead_letter_total = Counter::with_opts(Opts::new(
            "pacer_dead_letter_total",
            "Upload tasks moved to the dead-letter queue",
        ))?;

        let quota_bytes_freed_total = Counter::with_opts(Opts::new(
            "pacer_quota_bytes_freed_total",
            "Bytes deleted by storage quota enforcement",
        ))?;

        registry.register(Box::new(readings_accepted_total.clone()))?;
        registry.register(Box::new(readings_dropped_total.clone()))?;
        registry.register(Box::new(chunks_flushed_total.clone()))?;
        registry.register(Box::new(flush_retries_total.clone()))?;
        registry.register(Box::new(flush_failures_total.clone()))?;
        registry.register(Box::new(log_degraded_total.clone()))?;
        registry.register(Box::new(flush_duration_seconds.clone()))?;
        registry.register(Box::new(artifacts_encoded_total.clone()))?;
        registry.register(Box::new(artifact_bytes.clone()))?;
        registry.register(Box::new(upload_attempts_total.clone()))?;
        registry.register(Box::new(upload_duration_seconds.clone()))?;
        registry.register(Box::new(upload_tasks.clone()))?;
        registry.register(Box::new(dead_letter_total.clone()))?;
        registry.register(Box::new(quota_bytes_freed_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            readings_accepted_total,
            readings_dropped_total,
            chunks_flushed_total,
            flush_retries_total,
            flush_failures_total,
            log_degraded_total,
            flush_duration_seconds,
            artifacts_encoded_total,
            artifact_bytes,
            upload_attempts_total,
            upload_duration_seconds,
            upload_tasks,
            dead_letter_total,
            quota_bytes_freed_total,
        })
    }

    /// Get the Prometheus registry for exporting metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the text exposition format
    pub fn gather_text(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn record_reading_accepted(&self, metric: &str) {
        self.readings_accepted_total
            .with_label_values(&[metric])
            .inc();
    }

    pub fn record_reading_dropped(&self, reason: &str) {
        self.readings_dropped_total.with_label_values(&[reason]).inc();
    }

    /// Record a chunk that reached durable storage
    pub fn record_chunk_flushed(&self, duration_secs: f64) {
        self.chunks_flushed_total.inc();
        self.flush_duration_seconds.observe(duration_secs);
    }

    pub fn record_flush_retry(&self) {
        self.flush_retries_total.inc();
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures_total.inc();
    }

    pub fn record_log_degraded(&self) {
        self.log_degraded_total.inc();
    }

    pub fn record_artifact_encoded(&self, size_bytes: usize) {
        self.artifacts_encoded_total.inc();
        self.artifact_bytes.observe(size_bytes as f64);
    }

    /// Record one upload attempt
    pub fn record_upload_attempt(&self, outcome: &str, duration_secs: f64) {
        self.upload_attempts_total
            .with_label_values(&[outcome])
            .inc();
        self.upload_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_dead_letter(&self) {
        self.dead_letter_total.inc();
    }

    /// Set the gauge of tasks currently in `state`
    pub fn set_upload_tasks(&self, state: &str, count: usize) {
        self.upload_tasks
            .with_label_values(&[state])
            .set(count as f64);
    }

    pub fn record_quota_freed(&self, bytes: u64) {
        self.quota_bytes_freed_total.inc_by(bytes as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = PipelineMetrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_independent_registries() {
        let a = PipelineMetrics::new().unwrap();
        let b = PipelineMetrics::new().unwrap();
        a.record_flush_retry();
        assert_eq!(a.flush_retries_total.get(), 1.0);
        assert_eq!(b.flush_retries_total.get(), 0.0);
    }

    #[test]
    fn test_dropped_readings_by_reason() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_reading_dropped("overflow");
        metrics.record_reading_dropped("overflow");
        metrics.record_reading_dropped("malformed");

        assert_eq!(
            metrics
                .readings_dropped_total
                .with_label_values(&["overflow"])
                .get(),
            2.0
        );
        assert_eq!(
            metrics
                .readings_dropped_total
                .with_label_values(&["malformed"])
                .get(),
            1.0
        );
    }

    #[test]
    fn test_upload_attempt_and_gauge() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_upload_attempt("retryable", 0.2);
        metrics.record_upload_attempt("success", 0.4);
        metrics.set_upload_tasks("retrying", 3);
        metrics.set_upload_tasks("retrying", 1);

        assert_eq!(
            metrics
                .upload_attempts_total
                .with_label_values(&["success"])
                .get(),
            1.0
        );
        assert_eq!(
            metrics.upload_tasks.with_label_values(&["retrying"]).get(),
            1.0
        );
    }

    #[test]
    fn test_gather_text_contains_names() {
        let metrics = PipelineMetrics::new().unwrap();
        metrics.record_chunk_flushed(0.01);
        metrics.record_quota_freed(4096);

        let text = metrics.gather_text().unwrap();
        assert!(text.contains("pacer_chunks_flushed_total 1"));
        assert!(text.contains("pacer_quota_bytes_freed_total 4096"));
        assert!(text.contains("pacer_flush_duration_seconds_bucket"));
    }
}
