//! Encode sessions, read them back, and compare with the metrics summary

use chrono::{TimeZone, Utc};
use pacer_core::config::{EncoderConfig, MetricsConfig};
use pacer_core::{
    ClockOrigin, LogEntry, MetricKind, ProfileSnapshot, Reading, TimerAction, TimerEvent,
};
use pacer_fit::profile::{self, mesg_num};
use pacer_fit::{FitArtifact, FitEncoder, decode, validate};
use pacer_metrics::{MetricsSnapshot, replay};

fn profile() -> ProfileSnapshot {
    ProfileSnapshot {
        threshold_power: Some(300.0),
        threshold_hr: Some(165.0),
        max_hr: Some(188.0),
        weight_kg: Some(70.0),
    }
}

fn origin() -> ClockOrigin {
    ClockOrigin::new(Utc.with_ymd_and_hms(2024, 6, 2, 7, 30, 0).unwrap(), 5_000)
}

fn timer(ts: u64, action: TimerAction) -> LogEntry {
    TimerEvent::new(ts, action).into()
}

/// One hour alternating 200 W / 300 W with heart rate and speed
fn hour_of_intervals() -> Vec<LogEntry> {
    let start = origin().monotonic;
    let mut entries = vec![timer(start, TimerAction::Start)];
    for s in 0..3600u64 {
        let ts = start + s * 1000;
        let watts = if s % 2 == 0 { 200.0 } else { 300.0 };
        entries.push(Reading::power(ts, watts).into());
        entries.push(Reading::heart_rate(ts + 120, 140.0 + (s % 10) as f64).into());
        entries.push(Reading::speed(ts + 250, 9.5).into());
        entries.push(Reading::distance(ts + 250, s as f64 * 9.5).into());
    }
    entries.push(timer(start + 3_600_000, TimerAction::Stop));
    entries
}

fn encode(entries: &[LogEntry], end: u64) -> (FitArtifact, MetricsSnapshot) {
    let snapshot = replay(profile(), &MetricsConfig::default(), entries, end).unwrap();
    let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
    for entry in entries {
        encoder.apply(entry).unwrap();
    }
    (encoder.finalize(&snapshot).unwrap(), snapshot)
}

#[test]
fn test_summary_round_trips_within_rounding() {
    let entries = hour_of_intervals();
    let end = origin().monotonic + 3_600_000;
    let (artifact, snapshot) = encode(&entries, end);

    assert!(validate(&artifact.bytes).is_ok());
    let file = decode(&artifact.bytes).unwrap();

    assert_eq!(artifact.records, 3600);
    assert_eq!(file.count(mesg_num::RECORD), 3600);
    assert_eq!(file.count(mesg_num::EVENT), 2);
    assert_eq!(file.count(mesg_num::LAP), 1);
    assert_eq!(file.count(mesg_num::SESSION), 1);
    assert_eq!(file.count(mesg_num::ACTIVITY), 1);
    assert_eq!(file.messages[0].global, mesg_num::FILE_ID);
    assert_eq!(file.crc, artifact.crc);

    let session = file.first(mesg_num::SESSION).unwrap();
    let avg_power = snapshot.average(MetricKind::Power).unwrap();
    assert_eq!(
        session.uint(profile::session::AVG_POWER),
        Some(avg_power.round() as u64)
    );
    assert_eq!(session.uint(profile::session::MAX_POWER), Some(300));
    assert_eq!(
        session.uint(profile::session::AVG_HEART_RATE),
        Some(snapshot.average(MetricKind::HeartRate).unwrap().round() as u64)
    );

    let np = snapshot.normalized_power.unwrap();
    assert_eq!(
        session.uint(profile::session::NORMALIZED_POWER),
        Some(np.round() as u64)
    );
    let tss = session.uint(profile::session::TRAINING_STRESS_SCORE).unwrap() as f64 / 10.0;
    assert!((tss - snapshot.training_stress_score.unwrap()).abs() <= 0.05);
    let factor = session.uint(profile::session::INTENSITY_FACTOR).unwrap() as f64 / 1000.0;
    assert!((factor - snapshot.intensity_factor.unwrap()).abs() <= 0.0005);
    assert_eq!(session.uint(profile::session::THRESHOLD_POWER), Some(300));

    assert_eq!(
        session.uint(profile::summary::TOTAL_TIMER_TIME),
        Some((snapshot.duration_seconds * 1000.0).round() as u64)
    );
    let distance = session.uint(profile::summary::TOTAL_DISTANCE).unwrap() as f64 / 100.0;
    assert!((distance - snapshot.total_distance_m.unwrap()).abs() <= 0.01);

    let zones = session
        .field(profile::session::TIME_IN_POWER_ZONE)
        .unwrap()
        .as_u64_array();
    let expected = snapshot.power_zone_seconds.as_ref().unwrap();
    assert_eq!(zones.len(), expected.len());
    let encoded_ms: u64 = zones.iter().sum();
    let expected_ms: f64 = expected.iter().sum::<f64>() * 1000.0;
    assert!((encoded_ms as f64 - expected_ms).abs() <= zones.len() as f64);

    let start = session.uint(profile::summary::START_TIME).unwrap();
    let timestamp = session.timestamp().unwrap() as u64;
    assert_eq!(timestamp - start, 3600);
}

#[test]
fn test_rebuild_is_byte_identical() {
    let entries = hour_of_intervals();
    let end = origin().monotonic + 3_600_000;

    let (first, _) = encode(&entries, end);
    let (second, _) = encode(&entries, end);
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.crc, second.crc);
}

#[test]
fn test_paused_interval_excluded_from_timer_time() {
    let start = origin().monotonic;
    let mut entries = vec![timer(start, TimerAction::Start)];
    for s in 0..600u64 {
        entries.push(Reading::power(start + s * 1000, 220.0).into());
    }
    entries.push(timer(start + 600_000, TimerAction::Pause));
    entries.push(timer(start + 720_000, TimerAction::Resume));
    for s in 720..1320u64 {
        entries.push(Reading::power(start + s * 1000, 220.0).into());
    }
    entries.push(timer(start + 1_320_000, TimerAction::Stop));

    let (artifact, snapshot) = encode(&entries, start + 1_320_000);
    let file = decode(&artifact.bytes).unwrap();

    assert_eq!(file.count(mesg_num::RECORD), 1200);
    assert_eq!(file.count(mesg_num::EVENT), 4);

    let session = file.first(mesg_num::SESSION).unwrap();
    assert_eq!(session.uint(profile::summary::TOTAL_TIMER_TIME), Some(1_200_000));
    assert_eq!(
        session.uint(profile::summary::TOTAL_ELAPSED_TIME),
        Some(1_320_000)
    );
    assert_eq!(snapshot.duration_seconds, 1200.0);

    let activity = file.first(mesg_num::ACTIVITY).unwrap();
    assert_eq!(activity.uint(profile::activity::NUM_SESSIONS), Some(1));
    assert_eq!(
        activity.uint(profile::activity::TOTAL_TIMER_TIME),
        Some(1_200_000)
    );
}

#[test]
fn test_session_without_thresholds_omits_intensity() {
    let start = origin().monotonic;
    let mut entries = vec![timer(start, TimerAction::Start)];
    for s in 0..120u64 {
        entries.push(Reading::cadence(start + s * 1000, 85.0).into());
    }
    entries.push(timer(start + 120_000, TimerAction::Stop));

    let snapshot = replay(
        ProfileSnapshot::default(),
        &MetricsConfig::default(),
        &entries,
        start + 120_000,
    )
    .unwrap();
    let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
    for entry in &entries {
        encoder.apply(entry).unwrap();
    }
    let artifact = encoder.finalize(&snapshot).unwrap();

    let file = decode(&artifact.bytes).unwrap();
    let session = file.first(mesg_num::SESSION).unwrap();
    assert!(session.field(profile::session::INTENSITY_FACTOR).is_none());
    assert!(session.field(profile::session::TRAINING_STRESS_SCORE).is_none());
    assert!(session.field(profile::session::TIME_IN_POWER_ZONE).is_none());
    assert_eq!(session.uint(profile::session::AVG_CADENCE), Some(85));
    assert_eq!(session.uint(profile::session::SPORT), Some(2));
}
