//! Durable log records: entries, chunks and checkpoints

use crate::reading::{MonotonicMs, Reading};
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timer transitions recorded alongside readings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerAction {
    Start,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerEvent {
    pub timestamp: MonotonicMs,
    pub action: TimerAction,
}

impl TimerEvent {
    pub fn new(timestamp: MonotonicMs, action: TimerAction) -> Self {
        Self { timestamp, action }
    }
}

/// One entry of the durable log, in ingestion order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LogEntry {
    Reading(Reading),
    Timer(TimerEvent),
}

impl LogEntry {
    pub fn timestamp(&self) -> MonotonicMs {
        match self {
            LogEntry::Reading(reading) => reading.timestamp,
            LogEntry::Timer(event) => event.timestamp,
        }
    }
}

impl From<Reading> for LogEntry {
    fn from(reading: Reading) -> Self {
        LogEntry::Reading(reading)
    }
}

impl From<TimerEvent> for LogEntry {
    fn from(event: TimerEvent) -> Self {
        LogEntry::Timer(event)
    }
}

/// A batch of entries flushed together. Sequences start at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub session_id: SessionId,
    pub sequence: u64,
    pub entries: Vec<LogEntry>,
    pub flushed_at: DateTime<Utc>,
}

impl Chunk {
    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.entries.iter().filter_map(|entry| match entry {
            LogEntry::Reading(reading) => Some(reading),
            LogEntry::Timer(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Recovery marker naming the last durable chunk of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    /// Sequence of the last durable chunk, equal to the number of durable chunks
    pub chunk_index: u64,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
    /// Hex SHA-256 of the chunk payload this checkpoint was written for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_digest: Option<String>,
}

impl Checkpoint {
    /// Whether `self` is more recent than `other` for the same session
    pub fn supersedes(&self, other: &Checkpoint) -> bool {
        (self.chunk_index, self.is_final) > (other.chunk_index, other.is_final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;

    #[test]
    fn test_log_entry_serde_tagging() {
        let entry = LogEntry::from(Reading::heart_rate(1000, 130.0));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"entry\":\"reading\""));
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);

        let timer = LogEntry::from(TimerEvent::new(2000, TimerAction::Pause));
        let json = serde_json::to_string(&timer).unwrap();
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timestamp(), 2000);
    }

    #[test]
    fn test_chunk_readings_skip_timer_events() {
        let chunk = Chunk {
            session_id: SessionId::generate(),
            sequence: 1,
            entries: vec![
                TimerEvent::new(0, TimerAction::Start).into(),
                Reading::power(0, 200.0).into(),
                Reading::power(1000, 210.0).into(),
            ],
            flushed_at: Utc::now(),
        };
        assert_eq!(chunk.len(), 3);
        assert_eq!(chunk.readings().count(), 2);
    }

    #[test]
    fn test_final_checkpoint_supersedes_same_index() {
        let session_id = SessionId::generate();
        let base = Checkpoint {
            session_id: session_id.clone(),
            chunk_index: 4,
            is_final: false,
            created_at: Utc::now(),
            chunk_digest: None,
        };
        let finalized = Checkpoint {
            is_final: true,
            ..base.clone()
        };
        let later = Checkpoint {
            chunk_index: 5,
            ..base.clone()
        };
        assert!(finalized.supersedes(&base));
        assert!(later.supersedes(&finalized));
        assert!(!base.supersedes(&base));
    }
}
