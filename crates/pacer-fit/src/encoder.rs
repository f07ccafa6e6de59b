//! Incremental FIT activity encoder
//!
//! Readings are grouped into one record row per FIT second. The open row is
//! written as soon as a later second, a timer event or `finalize` arrives, so
//! memory holds encoded bytes and a single row, never the raw session.
//!
//! Output is a pure function of the clock origin, the configuration and the
//! sequence of calls, which is what lets a session be re-encoded from its log
//! byte for byte.

use crate::crc::{Crc16, combine, crc16};
use crate::definition::{Binding, DefinitionTable};
use crate::error::{EncodeError, EncodeResult};
use crate::message::{Field, Message};
use crate::profile::{
    self, DATA_TYPE, HEADER_SIZE, PROFILE_VERSION, PROTOCOL_VERSION, TIMESTAMP,
    fit_timestamp, mesg_num, scale_altitude, scale_i8, scale_u8, scale_u16, scale_u32,
    to_semicircles,
};
use bytes::{BufMut, Bytes, BytesMut};
use pacer_core::config::EncoderConfig;
use pacer_core::{
    ClockOrigin, LogEntry, MetricKind, MetricValue, MonotonicMs, Reading, TimerAction, TimerEvent,
};
use pacer_metrics::MetricsSnapshot;
use tracing::debug;

/// A finished FIT file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitArtifact {
    pub bytes: Bytes,
    pub size: usize,
    /// Record messages written
    pub records: u64,
    /// Trailing file CRC
    pub crc: u16,
}

/// One record message under construction; values are already scaled
#[derive(Debug, Clone, Default)]
struct RecordRow {
    timestamp: u32,
    position: Option<(i32, i32)>,
    altitude: Option<u16>,
    heart_rate: Option<u8>,
    cadence: Option<u8>,
    distance: Option<u32>,
    speed: Option<u16>,
    power: Option<u16>,
    temperature: Option<i8>,
}

impl RecordRow {
    fn new(timestamp: u32) -> Self {
        Self {
            timestamp,
            ..Self::default()
        }
    }

    /// Last write wins per field
    fn set(&mut self, value: &MetricValue) {
        match *value {
            MetricValue::Power(watts) => self.power = Some(scale_u16(watts, 1.0)),
            MetricValue::HeartRate(bpm) => self.heart_rate = Some(scale_u8(bpm)),
            MetricValue::Cadence(rpm) => self.cadence = Some(scale_u8(rpm)),
            MetricValue::Speed(mps) => self.speed = Some(scale_u16(mps, 1000.0)),
            MetricValue::Distance(meters) => self.distance = Some(scale_u32(meters, 100.0)),
            MetricValue::Temperature(celsius) => self.temperature = Some(scale_i8(celsius)),
            MetricValue::Location(point) => {
                self.position = Some((to_semicircles(point.lat), to_semicircles(point.lon)));
                if let Some(altitude) = point.altitude {
                    self.altitude = Some(scale_altitude(altitude));
                }
            }
        }
    }

    fn to_message(&self) -> Message {
        use profile::record::*;

        Message::new(mesg_num::RECORD)
            .with(Field::uint32(TIMESTAMP, self.timestamp))
            .with_opt(self.position.map(|p| p.0), |lat| Field::sint32(POSITION_LAT, lat))
            .with_opt(self.position.map(|p| p.1), |lon| Field::sint32(POSITION_LONG, lon))
            .with_opt(self.altitude, |v| Field::uint16(ALTITUDE, v))
            .with_opt(self.heart_rate, |v| Field::uint8(HEART_RATE, v))
            .with_opt(self.cadence, |v| Field::uint8(CADENCE, v))
            .with_opt(self.distance, |v| Field::uint32(DISTANCE, v))
            .with_opt(self.speed, |v| Field::uint16(SPEED, v))
            .with_opt(self.power, |v| Field::uint16(POWER, v))
            .with_opt(self.temperature, |v| Field::sint8(TEMPERATURE, v))
    }
}

pub struct FitEncoder {
    origin: ClockOrigin,
    config: EncoderConfig,
    data: BytesMut,
    crc: Crc16,
    definitions: DefinitionTable,
    row: Option<RecordRow>,
    first_timestamp: Option<u32>,
    records: u64,
    definitions_written: u64,
    evictions: u64,
    finalized: bool,
}

impl FitEncoder {
    /// Start a file; the file id message is written immediately
    pub fn new(origin: ClockOrigin, config: &EncoderConfig) -> Self {
        let mut encoder = Self {
            origin,
            config: config.clone(),
            data: BytesMut::with_capacity(64 * 1024),
            crc: Crc16::new(),
            definitions: DefinitionTable::new(config.max_local_definitions),
            row: None,
            first_timestamp: None,
            records: 0,
            definitions_written: 0,
            evictions: 0,
            finalized: false,
        };

        let file_id = {
            use profile::file_id::*;
            Message::new(mesg_num::FILE_ID)
                .with(Field::enumeration(TYPE, profile::FILE_TYPE_ACTIVITY))
                .with(Field::uint16(MANUFACTURER, profile::MANUFACTURER_DEVELOPMENT))
                .with(Field::uint16(PRODUCT, config.product_id))
                .with(Field::uint32z(SERIAL_NUMBER, config.serial_number))
                .with(Field::uint32(TIME_CREATED, fit_timestamp(origin.wall)))
        };
        encoder.emit(&file_id);
        encoder
    }

    fn fit_time(&self, timestamp: MonotonicMs) -> u32 {
        fit_timestamp(self.origin.wall_time(timestamp))
    }

    fn ensure_open(&self) -> EncodeResult<()> {
        if self.finalized {
            Err(EncodeError::AlreadyFinalized)
        } else {
            Ok(())
        }
    }

    /// Write a message, preceded by its definition when the shape is unbound
    fn emit(&mut self, message: &Message) {
        let start = self.data.len();
        let definition = message.definition();
        let binding = self.definitions.bind(&definition);
        if let Binding::New { local, evicted } = binding {
            definition.write(local, &mut self.data);
            self.definitions_written += 1;
            if evicted {
                self.evictions += 1;
            }
        }
        message.write_data(binding.local(), &mut self.data);
        self.crc.update(&self.data[start..]);
    }

    fn close_row(&mut self) {
        if let Some(row) = self.row.take() {
            self.emit(&row.to_message());
            self.records += 1;
        }
    }

    pub fn add_reading(&mut self, reading: &Reading) -> EncodeResult<()> {
        self.ensure_open()?;
        reading.validate()?;

        let second = self.fit_time(reading.timestamp);
        match self.row.as_ref().map(|row| row.timestamp) {
            Some(open) if second > open => {
                self.close_row();
                self.row = Some(RecordRow::new(second));
            }
            // Same second, or an earlier one skewed behind another metric
            Some(_) => {}
            None => self.row = Some(RecordRow::new(second)),
        }
        self.first_timestamp.get_or_insert(second);

        if let Some(row) = self.row.as_mut() {
            row.set(&reading.value);
        }
        Ok(())
    }

    pub fn add_timer_event(&mut self, event: &TimerEvent) -> EncodeResult<()> {
        self.ensure_open()?;
        self.close_row();

        let event_type = match event.action {
            TimerAction::Start | TimerAction::Resume => profile::EVENT_TYPE_START,
            TimerAction::Pause | TimerAction::Stop => profile::EVENT_TYPE_STOP_ALL,
        };
        let timestamp = self.fit_time(event.timestamp);
        self.first_timestamp.get_or_insert(timestamp);

        let message = Message::new(mesg_num::EVENT)
            .with(Field::uint32(TIMESTAMP, timestamp))
            .with(Field::enumeration(profile::event::EVENT, profile::EVENT_TIMER))
            .with(Field::enumeration(profile::event::EVENT_TYPE, event_type));
        self.emit(&message);
        Ok(())
    }

    /// Feed one log entry
    pub fn apply(&mut self, entry: &LogEntry) -> EncodeResult<()> {
        match entry {
            LogEntry::Reading(reading) => self.add_reading(reading),
            LogEntry::Timer(event) => self.add_timer_event(event),
        }
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn definitions_written(&self) -> u64 {
        self.definitions_written
    }

    /// Bytes written after the header so far
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Write lap, session and activity summaries and seal the file
    pub fn finalize(&mut self, summary: &MetricsSnapshot) -> EncodeResult<FitArtifact> {
        self.ensure_open()?;
        self.finalized = true;
        self.close_row();

        let end = self.fit_time(summary.ended_at);
        let start = summary
            .started_at
            .map(|ts| self.fit_time(ts))
            .or(self.first_timestamp)
            .unwrap_or(end);

        let totals = Totals::from_snapshot(summary);
        self.emit(&lap_message(start, end, &totals));
        self.emit(&session_message(
            start,
            end,
            &totals,
            summary,
            profile::sport_code(self.config.sport),
        ));
        self.emit(&activity_message(end, &totals));

        let data_size =
            u32::try_from(self.data.len()).map_err(|_| EncodeError::TooLarge(self.data.len()))?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0] = HEADER_SIZE;
        header[1] = PROTOCOL_VERSION;
        header[2..4].copy_from_slice(&PROFILE_VERSION.to_le_bytes());
        header[4..8].copy_from_slice(&data_size.to_le_bytes());
        header[8..12].copy_from_slice(DATA_TYPE);
        let header_crc = crc16(&header[..12]);
        header[12..14].copy_from_slice(&header_crc.to_le_bytes());

        let file_crc = combine(crc16(&header), self.crc.value(), self.crc.len());

        let data = std::mem::take(&mut self.data);
        let mut out = BytesMut::with_capacity(header.len() + data.len() + 2);
        out.put_slice(&header);
        out.put_slice(&data);
        out.put_u16_le(file_crc);
        let bytes = out.freeze();

        debug!(
            size = bytes.len(),
            records = self.records,
            definitions = self.definitions_written,
            evictions = self.evictions,
            "FIT file finalized"
        );

        Ok(FitArtifact {
            size: bytes.len(),
            bytes,
            records: self.records,
            crc: file_crc,
        })
    }
}

/// Summary values shared by the lap, session and activity messages
struct Totals {
    elapsed_ms: u32,
    timer_ms: u32,
    distance: Option<u32>,
    avg_speed: Option<u16>,
    max_speed: Option<u16>,
    avg_heart_rate: Option<u8>,
    max_heart_rate: Option<u8>,
    avg_cadence: Option<u8>,
    max_cadence: Option<u8>,
    avg_power: Option<u16>,
    max_power: Option<u16>,
}

impl Totals {
    fn from_snapshot(summary: &MetricsSnapshot) -> Self {
        Self {
            elapsed_ms: scale_u32(summary.wall_seconds, 1000.0),
            timer_ms: scale_u32(summary.duration_seconds, 1000.0),
            distance: summary.total_distance_m.map(|m| scale_u32(m, 100.0)),
            avg_speed: summary
                .average(MetricKind::Speed)
                .map(|v| scale_u16(v, 1000.0)),
            max_speed: summary
                .maximum(MetricKind::Speed)
                .map(|v| scale_u16(v, 1000.0)),
            avg_heart_rate: summary.average(MetricKind::HeartRate).map(scale_u8),
            max_heart_rate: summary.maximum(MetricKind::HeartRate).map(scale_u8),
            avg_cadence: summary.average(MetricKind::Cadence).map(scale_u8),
            max_cadence: summary.maximum(MetricKind::Cadence).map(scale_u8),
            avg_power: summary
                .average(MetricKind::Power)
                .map(|v| scale_u16(v, 1.0)),
            max_power: summary
                .maximum(MetricKind::Power)
                .map(|v| scale_u16(v, 1.0)),
        }
    }
}

fn summary_base(global: u16, event: u8, start: u32, end: u32, totals: &Totals) -> Message {
    use profile::summary::*;

    Message::new(global)
        .with(Field::uint32(TIMESTAMP, end))
        .with(Field::enumeration(EVENT, event))
        .with(Field::enumeration(EVENT_TYPE, profile::EVENT_TYPE_STOP))
        .with(Field::uint32(START_TIME, start))
        .with(Field::uint32(TOTAL_ELAPSED_TIME, totals.elapsed_ms))
        .with(Field::uint32(TOTAL_TIMER_TIME, totals.timer_ms))
        .with_opt(totals.distance, |v| Field::uint32(TOTAL_DISTANCE, v))
}

fn lap_message(start: u32, end: u32, totals: &Totals) -> Message {
    use profile::lap::*;

    summary_base(mesg_num::LAP, profile::EVENT_LAP, start, end, totals)
        .with_opt(totals.avg_speed, |v| Field::uint16(AVG_SPEED, v))
        .with_opt(totals.max_speed, |v| Field::uint16(MAX_SPEED, v))
        .with_opt(totals.avg_heart_rate, |v| Field::uint8(AVG_HEART_RATE, v))
        .with_opt(totals.max_heart_rate, |v| Field::uint8(MAX_HEART_RATE, v))
        .with_opt(totals.avg_cadence, |v| Field::uint8(AVG_CADENCE, v))
        .with_opt(totals.max_cadence, |v| Field::uint8(MAX_CADENCE, v))
        .with_opt(totals.avg_power, |v| Field::uint16(AVG_POWER, v))
        .with_opt(totals.max_power, |v| Field::uint16(MAX_POWER, v))
}

fn zone_millis(seconds: &[f64]) -> Vec<u32> {
    seconds.iter().map(|s| scale_u32(*s, 1000.0)).collect()
}

fn session_message(
    start: u32,
    end: u32,
    totals: &Totals,
    summary: &MetricsSnapshot,
    sport: u8,
) -> Message {
    use profile::session::*;

    summary_base(mesg_num::SESSION, profile::EVENT_SESSION, start, end, totals)
        .with(Field::enumeration(SPORT, sport))
        .with(Field::enumeration(SUB_SPORT, profile::SUB_SPORT_GENERIC))
        .with_opt(totals.avg_speed, |v| Field::uint16(AVG_SPEED, v))
        .with_opt(totals.max_speed, |v| Field::uint16(MAX_SPEED, v))
        .with_opt(totals.avg_heart_rate, |v| Field::uint8(AVG_HEART_RATE, v))
        .with_opt(totals.max_heart_rate, |v| Field::uint8(MAX_HEART_RATE, v))
        .with_opt(totals.avg_cadence, |v| Field::uint8(AVG_CADENCE, v))
        .with_opt(totals.max_cadence, |v| Field::uint8(MAX_CADENCE, v))
        .with_opt(totals.avg_power, |v| Field::uint16(AVG_POWER, v))
        .with_opt(totals.max_power, |v| Field::uint16(MAX_POWER, v))
        .with(Field::uint16(FIRST_LAP_INDEX, 0))
        .with(Field::uint16(NUM_LAPS, 1))
        .with_opt(summary.normalized_power, |np| {
            Field::uint16(NORMALIZED_POWER, scale_u16(np, 1.0))
        })
        .with_opt(summary.training_stress_score, |tss| {
            Field::uint16(TRAINING_STRESS_SCORE, scale_u16(tss, 10.0))
        })
        .with_opt(summary.intensity_factor, |factor| {
            Field::uint16(INTENSITY_FACTOR, scale_u16(factor, 1000.0))
        })
        .with_opt(summary.threshold_power, |ftp| {
            Field::uint16(THRESHOLD_POWER, scale_u16(ftp, 1.0))
        })
        .with_opt(
            summary.heart_rate_zone_seconds.as_deref().filter(|z| !z.is_empty()),
            |zones| Field::uint32_array(TIME_IN_HR_ZONE, &zone_millis(zones)),
        )
        .with_opt(
            summary.power_zone_seconds.as_deref().filter(|z| !z.is_empty()),
            |zones| Field::uint32_array(TIME_IN_POWER_ZONE, &zone_millis(zones)),
        )
}

fn activity_message(end: u32, totals: &Totals) -> Message {
    use profile::activity::*;

    Message::new(mesg_num::ACTIVITY)
        .with(Field::uint32(TIMESTAMP, end))
        .with(Field::uint32(TOTAL_TIMER_TIME, totals.timer_ms))
        .with(Field::uint16(NUM_SESSIONS, 1))
        .with(Field::enumeration(TYPE, profile::ACTIVITY_TYPE_MANUAL))
        .with(Field::enumeration(EVENT, profile::EVENT_ACTIVITY))
        .with(Field::enumeration(EVENT_TYPE, profile::EVENT_TYPE_STOP))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use chrono::{TimeZone, Utc};
    use pacer_core::{GeoPoint, ProfileSnapshot};
    use pacer_metrics::replay;

    fn origin() -> ClockOrigin {
        ClockOrigin::new(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap(), 0)
    }

    fn snapshot(entries: &[LogEntry], end: MonotonicMs) -> MetricsSnapshot {
        replay(
            ProfileSnapshot::default(),
            &Default::default(),
            entries,
            end,
        )
        .unwrap()
    }

    #[test]
    fn test_header_layout() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        let artifact = encoder.finalize(&snapshot(&[], 0)).unwrap();
        let bytes = &artifact.bytes;

        assert_eq!(bytes[0], 14);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(u16::from_le_bytes([bytes[2], bytes[3]]), 2132);
        let data_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
        assert_eq!(&bytes[8..12], b".FIT");
        assert_eq!(u16::from_le_bytes([bytes[12], bytes[13]]), crc16(&bytes[..12]));
        assert_eq!(bytes.len(), 14 + data_size + 2);
        assert_eq!(artifact.size, bytes.len());
        assert_eq!(crc16(bytes), 0);
    }

    #[test]
    fn test_calls_after_finalize_fail_fast() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        encoder.finalize(&snapshot(&[], 0)).unwrap();

        assert_eq!(
            encoder.finalize(&snapshot(&[], 0)),
            Err(EncodeError::AlreadyFinalized)
        );
        assert_eq!(
            encoder.add_reading(&Reading::power(0, 100.0)),
            Err(EncodeError::AlreadyFinalized)
        );
        assert_eq!(
            encoder.add_timer_event(&TimerEvent::new(0, TimerAction::Stop)),
            Err(EncodeError::AlreadyFinalized)
        );
    }

    #[test]
    fn test_invalid_reading_fails_fast() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        assert!(matches!(
            encoder.add_reading(&Reading::heart_rate(0, f64::NAN)),
            Err(EncodeError::InvalidReading(_))
        ));
        assert_eq!(encoder.records(), 0);
    }

    #[test]
    fn test_readings_grouped_per_second() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        encoder.add_reading(&Reading::power(0, 200.0)).unwrap();
        encoder.add_reading(&Reading::heart_rate(300, 120.0)).unwrap();
        encoder.add_reading(&Reading::power(900, 210.0)).unwrap();
        assert_eq!(encoder.records(), 0);

        encoder.add_reading(&Reading::power(1000, 220.0)).unwrap();
        assert_eq!(encoder.records(), 1);
        // Skewed behind the open row: folded into it
        encoder.add_reading(&Reading::heart_rate(800, 125.0)).unwrap();

        let artifact = encoder.finalize(&snapshot(&[], 2000)).unwrap();
        assert_eq!(artifact.records, 2);

        let file = decode(&artifact.bytes).unwrap();
        let records: Vec<_> = file.messages_of(mesg_num::RECORD).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].uint(profile::record::POWER), Some(210));
        assert_eq!(records[0].uint(profile::record::HEART_RATE), Some(120));
        assert_eq!(records[1].uint(profile::record::POWER), Some(220));
        assert_eq!(records[1].uint(profile::record::HEART_RATE), Some(125));
        assert_eq!(
            records[1].timestamp().unwrap() - records[0].timestamp().unwrap(),
            1
        );
    }

    #[test]
    fn test_definition_written_only_on_shape_change() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        let after_file_id = encoder.definitions_written();

        for s in 0..10u64 {
            encoder.add_reading(&Reading::power(s * 1000, 200.0)).unwrap();
        }
        encoder.add_reading(&Reading::power(10_000, 200.0)).unwrap();
        assert_eq!(encoder.definitions_written(), after_file_id + 1);

        encoder.add_reading(&Reading::heart_rate(10_000, 130.0)).unwrap();
        encoder.add_reading(&Reading::power(11_000, 200.0)).unwrap();
        encoder.add_reading(&Reading::power(12_000, 200.0)).unwrap();
        assert_eq!(encoder.definitions_written(), after_file_id + 2);
    }

    #[test]
    fn test_single_slot_rebinds_on_every_shape_change() {
        let config = EncoderConfig {
            max_local_definitions: 1,
            ..EncoderConfig::default()
        };
        let mut encoder = FitEncoder::new(origin(), &config);
        encoder.add_reading(&Reading::power(0, 200.0)).unwrap();
        encoder.add_timer_event(&TimerEvent::new(500, TimerAction::Pause)).unwrap();
        encoder.add_timer_event(&TimerEvent::new(600, TimerAction::Resume)).unwrap();
        encoder.add_reading(&Reading::power(1000, 200.0)).unwrap();
        let artifact = encoder.finalize(&snapshot(&[], 2000)).unwrap();

        let file = decode(&artifact.bytes).unwrap();
        assert_eq!(file.count(mesg_num::RECORD), 2);
        assert_eq!(file.count(mesg_num::EVENT), 2);
        // file_id, record, event, record, lap, session, activity
        assert_eq!(file.definitions, 7);
    }

    #[test]
    fn test_location_scaling() {
        let mut encoder = FitEncoder::new(origin(), &EncoderConfig::default());
        let point = GeoPoint::new(59.9139, 10.7522).with_altitude(23.0);
        encoder.add_reading(&Reading::location(0, point)).unwrap();
        let artifact = encoder.finalize(&snapshot(&[], 1000)).unwrap();

        let file = decode(&artifact.bytes).unwrap();
        let record = file.first(mesg_num::RECORD).unwrap();
        let lat = record.sint(profile::record::POSITION_LAT).unwrap() as i32;
        assert!((profile::from_semicircles(lat) - 59.9139).abs() < 1e-6);
        assert_eq!(
            record.uint(profile::record::ALTITUDE),
            Some(u64::from(scale_altitude(23.0)))
        );
    }
}
