//! The subset of the FIT profile written by the encoder

use chrono::{DateTime, Utc};
use pacer_core::Sport;

pub const HEADER_SIZE: u8 = 14;
/// Protocol 2.0
pub const PROTOCOL_VERSION: u8 = 0x20;
/// Profile 21.32
pub const PROFILE_VERSION: u16 = 2132;
pub const DATA_TYPE: &[u8; 4] = b".FIT";
pub const MAX_LOCAL_MESSAGES: u8 = 16;

/// Seconds from the Unix epoch to the FIT epoch, 1989-12-31T00:00:00Z
pub const FIT_EPOCH_OFFSET: i64 = 631_065_600;

/// Record header bits
pub const DEFINITION_FLAG: u8 = 0x40;
pub const DEVELOPER_DATA_FLAG: u8 = 0x20;
pub const COMPRESSED_TIMESTAMP_FLAG: u8 = 0x80;
pub const LOCAL_MESSAGE_MASK: u8 = 0x0F;

/// FIT base types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Enum,
    Sint8,
    Uint8,
    Sint16,
    Uint16,
    Sint32,
    Uint32,
    String,
    Uint8z,
    Uint16z,
    Uint32z,
    Byte,
}

impl BaseType {
    pub fn id(self) -> u8 {
        match self {
            BaseType::Enum => 0x00,
            BaseType::Sint8 => 0x01,
            BaseType::Uint8 => 0x02,
            BaseType::Sint16 => 0x83,
            BaseType::Uint16 => 0x84,
            BaseType::Sint32 => 0x85,
            BaseType::Uint32 => 0x86,
            BaseType::String => 0x07,
            BaseType::Uint8z => 0x0A,
            BaseType::Uint16z => 0x8B,
            BaseType::Uint32z => 0x8C,
            BaseType::Byte => 0x0D,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        let base = match id {
            0x00 => BaseType::Enum,
            0x01 => BaseType::Sint8,
            0x02 => BaseType::Uint8,
            0x83 => BaseType::Sint16,
            0x84 => BaseType::Uint16,
            0x85 => BaseType::Sint32,
            0x86 => BaseType::Uint32,
            0x07 => BaseType::String,
            0x0A => BaseType::Uint8z,
            0x8B => BaseType::Uint16z,
            0x8C => BaseType::Uint32z,
            0x0D => BaseType::Byte,
            _ => return None,
        };
        Some(base)
    }

    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            BaseType::Sint16 | BaseType::Uint16 | BaseType::Uint16z => 2,
            BaseType::Sint32 | BaseType::Uint32 | BaseType::Uint32z => 4,
            _ => 1,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, BaseType::Sint8 | BaseType::Sint16 | BaseType::Sint32)
    }

    /// Raw value marking "no data", as a little-endian integer
    pub fn invalid(self) -> u64 {
        match self {
            BaseType::Enum | BaseType::Uint8 | BaseType::Byte => 0xFF,
            BaseType::Sint8 => 0x7F,
            BaseType::Sint16 => 0x7FFF,
            BaseType::Uint16 => 0xFFFF,
            BaseType::Sint32 => 0x7FFF_FFFF,
            BaseType::Uint32 => 0xFFFF_FFFF,
            BaseType::String | BaseType::Uint8z | BaseType::Uint16z | BaseType::Uint32z => 0,
        }
    }
}

/// Global message numbers
pub mod mesg_num {
    pub const FILE_ID: u16 = 0;
    pub const SESSION: u16 = 18;
    pub const LAP: u16 = 19;
    pub const RECORD: u16 = 20;
    pub const EVENT: u16 = 21;
    pub const ACTIVITY: u16 = 34;
}

/// Field 253, shared by every timestamped message
pub const TIMESTAMP: u8 = 253;

pub mod file_id {
    pub const TYPE: u8 = 0;
    pub const MANUFACTURER: u8 = 1;
    pub const PRODUCT: u8 = 2;
    pub const SERIAL_NUMBER: u8 = 3;
    pub const TIME_CREATED: u8 = 4;
}

pub mod record {
    pub const POSITION_LAT: u8 = 0;
    pub const POSITION_LONG: u8 = 1;
    /// (m + 500) * 5
    pub const ALTITUDE: u8 = 2;
    pub const HEART_RATE: u8 = 3;
    pub const CADENCE: u8 = 4;
    /// m * 100
    pub const DISTANCE: u8 = 5;
    /// m/s * 1000
    pub const SPEED: u8 = 6;
    pub const POWER: u8 = 7;
    pub const TEMPERATURE: u8 = 13;
}

pub mod event {
    pub const EVENT: u8 = 0;
    pub const EVENT_TYPE: u8 = 1;
}

/// Fields shared by lap and session summaries
pub mod summary {
    pub const EVENT: u8 = 0;
    pub const EVENT_TYPE: u8 = 1;
    pub const START_TIME: u8 = 2;
    /// s * 1000
    pub const TOTAL_ELAPSED_TIME: u8 = 7;
    /// s * 1000
    pub const TOTAL_TIMER_TIME: u8 = 8;
    /// m * 100
    pub const TOTAL_DISTANCE: u8 = 9;
}

pub mod lap {
    pub const AVG_SPEED: u8 = 13;
    pub const MAX_SPEED: u8 = 14;
    pub const AVG_HEART_RATE: u8 = 15;
    pub const MAX_HEART_RATE: u8 = 16;
    pub const AVG_CADENCE: u8 = 17;
    pub const MAX_CADENCE: u8 = 18;
    pub const AVG_POWER: u8 = 19;
    pub const MAX_POWER: u8 = 20;
}

pub mod session {
    pub const SPORT: u8 = 5;
    pub const SUB_SPORT: u8 = 6;
    pub const AVG_SPEED: u8 = 14;
    pub const MAX_SPEED: u8 = 15;
    pub const AVG_HEART_RATE: u8 = 16;
    pub const MAX_HEART_RATE: u8 = 17;
    pub const AVG_CADENCE: u8 = 18;
    pub const MAX_CADENCE: u8 = 19;
    pub const AVG_POWER: u8 = 20;
    pub const MAX_POWER: u8 = 21;
    pub const FIRST_LAP_INDEX: u8 = 25;
    pub const NUM_LAPS: u8 = 26;
    pub const NORMALIZED_POWER: u8 = 34;
    /// * 10
    pub const TRAINING_STRESS_SCORE: u8 = 35;
    /// * 1000
    pub const INTENSITY_FACTOR: u8 = 36;
    pub const THRESHOLD_POWER: u8 = 45;
    /// ms per zone
    pub const TIME_IN_HR_ZONE: u8 = 65;
    /// ms per zone
    pub const TIME_IN_POWER_ZONE: u8 = 68;
}

pub mod activity {
    pub const TOTAL_TIMER_TIME: u8 = 0;
    pub const NUM_SESSIONS: u8 = 1;
    pub const TYPE: u8 = 2;
    pub const EVENT: u8 = 3;
    pub const EVENT_TYPE: u8 = 4;
}

// Enum values
pub const FILE_TYPE_ACTIVITY: u8 = 4;
pub const MANUFACTURER_DEVELOPMENT: u16 = 255;
pub const EVENT_TIMER: u8 = 0;
pub const EVENT_SESSION: u8 = 8;
pub const EVENT_LAP: u8 = 9;
pub const EVENT_ACTIVITY: u8 = 26;
pub const EVENT_TYPE_START: u8 = 0;
pub const EVENT_TYPE_STOP: u8 = 1;
pub const EVENT_TYPE_STOP_ALL: u8 = 4;
pub const ACTIVITY_TYPE_MANUAL: u8 = 0;
pub const SUB_SPORT_GENERIC: u8 = 0;

pub fn sport_code(sport: Sport) -> u8 {
    match sport {
        Sport::Generic => 0,
        Sport::Running => 1,
        Sport::Cycling => 2,
    }
}

/// Seconds since the FIT epoch; instants before it map to 0
pub fn fit_timestamp(at: DateTime<Utc>) -> u32 {
    let seconds = at.timestamp() - FIT_EPOCH_OFFSET;
    seconds.clamp(0, i64::from(u32::MAX - 1)) as u32
}

pub fn to_semicircles(degrees: f64) -> i32 {
    let value = (degrees * (2f64.powi(31) / 180.0)).round();
    value.clamp(f64::from(i32::MIN), f64::from(i32::MAX - 1)) as i32
}

pub fn from_semicircles(semicircles: i32) -> f64 {
    f64::from(semicircles) * (180.0 / 2f64.powi(31))
}

// Scaled conversions round to nearest and clamp below the invalid sentinel

pub fn scale_u8(value: f64) -> u8 {
    value.round().clamp(0.0, 254.0) as u8
}

pub fn scale_i8(value: f64) -> i8 {
    value.round().clamp(-128.0, 126.0) as i8
}

pub fn scale_u16(value: f64, scale: f64) -> u16 {
    (value * scale).round().clamp(0.0, 65_534.0) as u16
}

pub fn scale_u32(value: f64, scale: f64) -> u32 {
    (value * scale).round().clamp(0.0, 4_294_967_294.0) as u32
}

/// Altitude in meters as stored in a record
pub fn scale_altitude(meters: f64) -> u16 {
    scale_u16(meters + 500.0, 5.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fit_epoch() {
        let epoch = Utc.with_ymd_and_hms(1989, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(fit_timestamp(epoch), 0);
        assert_eq!(fit_timestamp(epoch + chrono::Duration::seconds(90)), 90);
        assert_eq!(fit_timestamp(Utc.timestamp_opt(0, 0).unwrap()), 0);
    }

    #[test]
    fn test_semicircles() {
        assert_eq!(to_semicircles(0.0), 0);
        assert_eq!(to_semicircles(90.0), 1 << 30);
        assert_eq!(to_semicircles(-180.0), i32::MIN);
        assert!((from_semicircles(to_semicircles(59.9139)) - 59.9139).abs() < 1e-6);
    }

    #[test]
    fn test_scaling_stays_below_sentinel() {
        assert_eq!(scale_u8(300.0), 254);
        assert_eq!(scale_u16(70.0, 1000.0), 65_534);
        assert_eq!(scale_u16(8.3334, 1000.0), 8333);
        assert_eq!(scale_altitude(-500.0), 0);
        assert_eq!(scale_altitude(100.0), 3000);
        assert_eq!(scale_i8(127.0), 126);
    }

    #[test]
    fn test_base_type_ids_round_trip() {
        for base in [
            BaseType::Enum,
            BaseType::Sint8,
            BaseType::Uint8,
            BaseType::Sint16,
            BaseType::Uint16,
            BaseType::Sint32,
            BaseType::Uint32,
            BaseType::Uint32z,
        ] {
            assert_eq!(BaseType::from_id(base.id()), Some(base));
        }
        assert_eq!(BaseType::Uint16.size(), 2);
        assert_eq!(BaseType::from_id(0x42), None);
    }
}
