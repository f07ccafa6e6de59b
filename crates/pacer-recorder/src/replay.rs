//! Rebuild projections from a session log
//!
//! The log is the source of truth: replaying its entries through a fresh
//! metrics engine and encoder reproduces the live summary and a byte-identical
//! artifact. Logs cut short by a crash get a closing stop event at their last
//! timestamp.

use crate::error::RecorderResult;
use pacer_core::config::{EncoderConfig, MetricsConfig};
use pacer_core::{LogEntry, MonotonicMs, TimerAction, TimerEvent};
use pacer_fit::{EncodeError, FitArtifact, FitEncoder};
use pacer_metrics::{MetricsSnapshot, replay};
use pacer_storage::RecoveredSession;
use tracing::warn;

/// Summary and artifact rebuilt from a log
#[derive(Debug, Clone)]
pub struct RebuiltSession {
    pub summary: MetricsSnapshot,
    pub artifact: FitArtifact,
    /// Whether the log lacked a stop event and one was synthesized
    pub truncated: bool,
    /// Readings the encoder refused and left out of the artifact
    pub skipped: u64,
}

fn last_timer(recovered: &RecoveredSession) -> Option<TimerEvent> {
    recovered
        .entries()
        .filter_map(|entry| match entry {
            LogEntry::Timer(event) => Some(*event),
            LogEntry::Reading(_) => None,
        })
        .last()
}

/// End of the recording: its stop event, else its last entry
pub fn session_end(recovered: &RecoveredSession) -> MonotonicMs {
    match last_timer(recovered) {
        Some(event) if event.action == TimerAction::Stop => event.timestamp,
        _ => recovered
            .last_timestamp()
            .unwrap_or(recovered.manifest.clock_origin.monotonic),
    }
}

/// Replay a log into its summary and FIT artifact
pub fn rebuild_artifact(
    recovered: &RecoveredSession,
    metrics_config: &MetricsConfig,
    encoder_config: &EncoderConfig,
) -> RecorderResult<RebuiltSession> {
    let end = session_end(recovered);
    let stopped = matches!(
        last_timer(recovered),
        Some(event) if event.action == TimerAction::Stop
    );
    let closing: Option<LogEntry> =
        (!stopped).then(|| TimerEvent::new(end, TimerAction::Stop).into());
    let entries = || recovered.entries().chain(closing.iter());

    let summary = replay(recovered.manifest.profile, metrics_config, entries(), end)?;

    let mut encoder = FitEncoder::new(recovered.manifest.clock_origin, encoder_config);
    let mut skipped = 0;
    for entry in entries() {
        match encoder.apply(entry) {
            Ok(()) => {}
            Err(EncodeError::InvalidReading(e)) => {
                warn!(
                    session_id = %recovered.session_id(),
                    timestamp = entry.timestamp(),
                    error = %e,
                    "Skipping reading the encoder refused"
                );
                skipped += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
    let artifact = encoder.finalize(&summary)?;

    Ok(RebuiltSession {
        summary,
        artifact,
        truncated: !stopped,
        skipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pacer_core::{
        Checkpoint, Chunk, ClockOrigin, ProfileSnapshot, Reading, SessionId, SessionManifest,
    };

    fn recovered(entries: Vec<LogEntry>) -> RecoveredSession {
        let session_id = SessionId::generate();
        let origin = ClockOrigin::new(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(), 5_000);
        RecoveredSession {
            manifest: SessionManifest {
                session_id: session_id.clone(),
                owner: "athlete".to_string(),
                created_at: origin.wall,
                clock_origin: origin,
                profile: ProfileSnapshot::default(),
            },
            checkpoint: Checkpoint {
                session_id: session_id.clone(),
                chunk_index: 1,
                is_final: false,
                created_at: Utc::now(),
                chunk_digest: None,
            },
            chunks: vec![Chunk {
                session_id,
                sequence: 1,
                entries,
                flushed_at: Utc::now(),
            }],
        }
    }

    fn ride(stop: bool) -> Vec<LogEntry> {
        let mut entries: Vec<LogEntry> = vec![TimerEvent::new(5_000, TimerAction::Start).into()];
        for s in 1..=20u64 {
            entries.push(Reading::power(5_000 + s * 1000, 210.0).into());
        }
        if stop {
            entries.push(TimerEvent::new(30_000, TimerAction::Stop).into());
        }
        entries
    }

    #[test]
    fn test_session_end_prefers_stop_event() {
        assert_eq!(session_end(&recovered(ride(true))), 30_000);
        assert_eq!(session_end(&recovered(ride(false))), 25_000);
        assert_eq!(session_end(&recovered(Vec::new())), 5_000);
    }

    #[test]
    fn test_truncated_log_is_closed_at_last_entry() {
        let rebuilt = rebuild_artifact(
            &recovered(ride(false)),
            &MetricsConfig::default(),
            &EncoderConfig::default(),
        )
        .unwrap();
        assert!(rebuilt.truncated);
        assert_eq!(rebuilt.summary.duration_seconds, 20.0);
        assert_eq!(rebuilt.summary.readings_count, 20);
        pacer_fit::validate(&rebuilt.artifact.bytes).unwrap();
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let session = recovered(ride(true));
        let first =
            rebuild_artifact(&session, &MetricsConfig::default(), &EncoderConfig::default())
                .unwrap();
        let second =
            rebuild_artifact(&session, &MetricsConfig::default(), &EncoderConfig::default())
                .unwrap();
        assert!(!first.truncated);
        assert_eq!(first.skipped, 0);
        assert_eq!(first.summary.wall_seconds, 25.0);
        assert_eq!(first.artifact, second.artifact);
    }

    #[test]
    fn test_rebuild_leaves_out_refused_readings() {
        let clean = rebuild_artifact(
            &recovered(ride(true)),
            &MetricsConfig::default(),
            &EncoderConfig::default(),
        )
        .unwrap();

        let mut entries = ride(true);
        entries.insert(5, Reading::heart_rate(9_500, 400.0).into());
        let rebuilt = rebuild_artifact(
            &recovered(entries),
            &MetricsConfig::default(),
            &EncoderConfig::default(),
        )
        .unwrap();

        assert_eq!(rebuilt.skipped, 1);
        assert_eq!(rebuilt.artifact.records, clean.artifact.records);
        pacer_fit::validate(&rebuilt.artifact.bytes).unwrap();
    }
}
