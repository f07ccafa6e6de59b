//! Training zone tables

use pacer_core::ProfileSnapshot;
use serde::{Deserialize, Serialize};

/// Zone boundaries in absolute units (watts or bpm)
///
/// `n` upper bounds describe `n + 1` zones. Zones are `[lower, upper)`, so a
/// value equal to a bound belongs to the zone that bound opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneTable {
    upper_bounds: Vec<f64>,
}

impl ZoneTable {
    pub fn from_fractions(reference: f64, fractions: &[f64]) -> Self {
        Self {
            upper_bounds: fractions.iter().map(|f| reference * f).collect(),
        }
    }

    /// Power zones, absent without a usable threshold power
    pub fn power(profile: &ProfileSnapshot, fractions: &[f64]) -> Option<Self> {
        profile
            .ftp()
            .map(|ftp| Self::from_fractions(ftp, fractions))
    }

    /// Heart-rate zones from max HR, falling back to threshold HR
    pub fn heart_rate(profile: &ProfileSnapshot, fractions: &[f64]) -> Option<Self> {
        profile
            .max_heart_rate()
            .or_else(|| profile.lthr())
            .map(|reference| Self::from_fractions(reference, fractions))
    }

    pub fn zone_count(&self) -> usize {
        self.upper_bounds.len() + 1
    }

    /// Zone index (0-based) of a value
    pub fn zone_of(&self, value: f64) -> usize {
        self.upper_bounds.partition_point(|bound| *bound <= value)
    }

    pub fn upper_bounds(&self) -> &[f64] {
        &self.upper_bounds
    }
}
