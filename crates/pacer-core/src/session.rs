//! Sessions, profile snapshots and the persisted session manifest

use crate::error::{Error, Result};
use crate::reading::MonotonicMs;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable identifier of one recording
///
/// Generated ids are 32 lowercase hex characters. Ids read back from disk are
/// validated so they are always safe to use as a directory name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Parse an id, rejecting anything that could escape a directory
    pub fn parse(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() || id.len() > 255 {
            return Err(Error::InvalidSessionId(format!(
                "length {} outside 1..=255",
                id.len()
            )));
        }

        if id.contains("..") || id.contains('/') || id.contains('\\') {
            return Err(Error::InvalidSessionId(format!(
                "'{}' contains path traversal characters",
                id
            )));
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::InvalidSessionId(format!(
                "'{}': only alphanumeric, dash, and underscore allowed",
                id
            )));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

/// Lifecycle of a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Pending,
    Ready,
    Recording,
    Paused,
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Pending => "pending",
            SessionState::Ready => "ready",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Athlete thresholds captured once when a session is created
///
/// The snapshot is never re-read during a session so zones and intensity stay
/// stable for the whole recording.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    /// Functional threshold power in watts
    #[serde(default)]
    pub threshold_power: Option<f64>,
    /// Lactate threshold heart rate in bpm
    #[serde(default)]
    pub threshold_hr: Option<f64>,
    #[serde(default)]
    pub max_hr: Option<f64>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

impl ProfileSnapshot {
    /// Threshold power, if present and usable as a divisor
    pub fn ftp(&self) -> Option<f64> {
        positive(self.threshold_power)
    }

    /// Threshold heart rate, if present and usable as a divisor
    pub fn lthr(&self) -> Option<f64> {
        positive(self.threshold_hr)
    }

    pub fn max_heart_rate(&self) -> Option<f64> {
        positive(self.max_hr)
    }
}

/// Profile/config collaborator, read once per session
#[async_trait]
pub trait ProfileProvider: Send + Sync {
    async fn load_profile(&self, owner: &str) -> Result<ProfileSnapshot>;
}

#[async_trait]
impl ProfileProvider for ProfileSnapshot {
    async fn load_profile(&self, _owner: &str) -> Result<ProfileSnapshot> {
        Ok(*self)
    }
}

/// Maps the monotonic clock of a recording onto wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOrigin {
    pub wall: DateTime<Utc>,
    pub monotonic: MonotonicMs,
}

impl ClockOrigin {
    pub fn new(wall: DateTime<Utc>, monotonic: MonotonicMs) -> Self {
        Self { wall, monotonic }
    }

    /// Wall-clock time of a monotonic timestamp. Timestamps before the origin
    /// map onto the origin.
    pub fn wall_time(&self, timestamp: MonotonicMs) -> DateTime<Utc> {
        let offset = timestamp.saturating_sub(self.monotonic);
        self.wall + Duration::milliseconds(offset as i64)
    }
}

/// Everything needed to rebuild a session's projections from its log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub session_id: SessionId,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub clock_origin: ClockOrigin,
    pub profile: ProfileSnapshot,
}

/// The unit of work, owned by the recording orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub owner: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub readings_count: u64,
    pub chunk_index: u64,
    pub profile: ProfileSnapshot,
}

impl Session {
    pub fn new(id: SessionId, owner: impl Into<String>, profile: ProfileSnapshot) -> Self {
        Self {
            id,
            owner: owner.into(),
            state: SessionState::Pending,
            started_at: None,
            readings_count: 0,
            chunk_index: 0,
            profile,
        }
    }
}
