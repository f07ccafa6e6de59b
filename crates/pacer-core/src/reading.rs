//! Sensor readings
//!
//! A [`Reading`] is one immutable sample from the sensor layer. Metrics form a
//! closed set ([`MetricKind`]) so zone tables and encoder field layouts can be
//! chosen per variant without dynamic dispatch.

use crate::error::InvalidReading;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds on the recording's monotonic clock
pub type MonotonicMs = u64;

/// The metrics the pipeline understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Power,
    HeartRate,
    Cadence,
    Speed,
    Distance,
    Location,
    Temperature,
}

impl MetricKind {
    pub const ALL: [MetricKind; 7] = [
        MetricKind::Power,
        MetricKind::HeartRate,
        MetricKind::Cadence,
        MetricKind::Speed,
        MetricKind::Distance,
        MetricKind::Location,
        MetricKind::Temperature,
    ];

    /// Dense index, usable for fixed-size per-metric arrays
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricKind::Power => "power",
            MetricKind::HeartRate => "heart_rate",
            MetricKind::Cadence => "cadence",
            MetricKind::Speed => "speed",
            MetricKind::Distance => "distance",
            MetricKind::Location => "location",
            MetricKind::Temperature => "temperature",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GPS fix in decimal degrees, altitude in meters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            altitude: None,
        }
    }

    pub fn with_altitude(mut self, altitude: f64) -> Self {
        self.altitude = Some(altitude);
        self
    }
}

/// The value carried by a reading, tagged by metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "metric", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    /// Watts
    Power(f64),
    /// Beats per minute
    HeartRate(f64),
    /// Revolutions per minute
    Cadence(f64),
    /// Meters per second
    Speed(f64),
    /// Cumulative meters since the session started
    Distance(f64),
    Location(GeoPoint),
    /// Degrees Celsius
    Temperature(f64),
}

// (min, max) accepted for each scalar metric
const POWER_RANGE: (f64, f64) = (0.0, 4000.0);
const HEART_RATE_RANGE: (f64, f64) = (20.0, 250.0);
const CADENCE_RANGE: (f64, f64) = (0.0, 255.0);
const SPEED_RANGE: (f64, f64) = (0.0, 100.0);
const DISTANCE_RANGE: (f64, f64) = (0.0, 1.0e7);
const LATITUDE_RANGE: (f64, f64) = (-90.0, 90.0);
const LONGITUDE_RANGE: (f64, f64) = (-180.0, 180.0);
const ALTITUDE_RANGE: (f64, f64) = (-500.0, 9000.0);
const TEMPERATURE_RANGE: (f64, f64) = (-60.0, 70.0);

fn check(metric: MetricKind, value: f64, (min, max): (f64, f64)) -> Result<(), InvalidReading> {
    if !value.is_finite() {
        return Err(InvalidReading::NonFinite { metric });
    }
    if value < min || value > max {
        return Err(InvalidReading::OutOfRange {
            metric,
            value,
            min,
            max,
        });
    }
    Ok(())
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Power(_) => MetricKind::Power,
            MetricValue::HeartRate(_) => MetricKind::HeartRate,
            MetricValue::Cadence(_) => MetricKind::Cadence,
            MetricValue::Speed(_) => MetricKind::Speed,
            MetricValue::Distance(_) => MetricKind::Distance,
            MetricValue::Location(_) => MetricKind::Location,
            MetricValue::Temperature(_) => MetricKind::Temperature,
        }
    }

    /// Scalar used for averages, maxima and zones.
    ///
    /// Locations contribute their altitude, when the fix has one.
    pub fn scalar(&self) -> Option<f64> {
        match *self {
            MetricValue::Power(v)
            | MetricValue::HeartRate(v)
            | MetricValue::Cadence(v)
            | MetricValue::Speed(v)
            | MetricValue::Distance(v)
            | MetricValue::Temperature(v) => Some(v),
            MetricValue::Location(point) => point.altitude,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidReading> {
        let metric = self.kind();
        match *self {
            MetricValue::Power(v) => check(metric, v, POWER_RANGE),
            MetricValue::HeartRate(v) => check(metric, v, HEART_RATE_RANGE),
            MetricValue::Cadence(v) => check(metric, v, CADENCE_RANGE),
            MetricValue::Speed(v) => check(metric, v, SPEED_RANGE),
            MetricValue::Distance(v) => check(metric, v, DISTANCE_RANGE),
            MetricValue::Temperature(v) => check(metric, v, TEMPERATURE_RANGE),
            MetricValue::Location(point) => {
                check(metric, point.lat, LATITUDE_RANGE)?;
                check(metric, point.lon, LONGITUDE_RANGE)?;
                if let Some(altitude) = point.altitude {
                    check(metric, altitude, ALTITUDE_RANGE)?;
                }
                Ok(())
            }
        }
    }
}

/// One sensor sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: MonotonicMs,
    pub value: MetricValue,
}

impl Reading {
    pub fn new(timestamp: MonotonicMs, value: MetricValue) -> Self {
        Self { timestamp, value }
    }

    pub fn power(timestamp: MonotonicMs, watts: f64) -> Self {
        Self::new(timestamp, MetricValue::Power(watts))
    }

    pub fn heart_rate(timestamp: MonotonicMs, bpm: f64) -> Self {
        Self::new(timestamp, MetricValue::HeartRate(bpm))
    }

    pub fn cadence(timestamp: MonotonicMs, rpm: f64) -> Self {
        Self::new(timestamp, MetricValue::Cadence(rpm))
    }

    pub fn speed(timestamp: MonotonicMs, meters_per_second: f64) -> Self {
        Self::new(timestamp, MetricValue::Speed(meters_per_second))
    }

    pub fn distance(timestamp: MonotonicMs, meters: f64) -> Self {
        Self::new(timestamp, MetricValue::Distance(meters))
    }

    pub fn location(timestamp: MonotonicMs, point: GeoPoint) -> Self {
        Self::new(timestamp, MetricValue::Location(point))
    }

    pub fn temperature(timestamp: MonotonicMs, celsius: f64) -> Self {
        Self::new(timestamp, MetricValue::Temperature(celsius))
    }

    pub fn metric(&self) -> MetricKind {
        self.value.kind()
    }

    pub fn validate(&self) -> Result<(), InvalidReading> {
        self.value.validate()
    }
}
