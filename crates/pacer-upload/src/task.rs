//! Upload task records

use bytes::Bytes;
use chrono::{DateTime, Utc};
use pacer_core::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Retrying,
    DeadLetter,
    Resolved,
}

impl UploadState {
    pub const ALL: [UploadState; 4] = [
        UploadState::Pending,
        UploadState::Retrying,
        UploadState::DeadLetter,
        UploadState::Resolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Retrying => "retrying",
            UploadState::DeadLetter => "dead_letter",
            UploadState::Resolved => "resolved",
        }
    }

    /// Eligible for automatic attempts
    pub fn is_active(&self) -> bool {
        matches!(self, UploadState::Pending | UploadState::Retrying)
    }
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Retryable,
    Permanent,
    /// Artifact missing or failed verification; the store was never called
    Corrupt,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Retryable => "retryable",
            AttemptOutcome::Permanent => "permanent",
            AttemptOutcome::Corrupt => "corrupt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A finalized artifact handed over for upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub session_id: SessionId,
    pub owner: String,
    pub artifact: Bytes,
}

impl UploadRequest {
    pub fn new(session_id: SessionId, owner: impl Into<String>, artifact: Bytes) -> Self {
        Self {
            session_id,
            owner: owner.into(),
            artifact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub id: String,
    pub session_id: SessionId,
    pub owner: String,
    pub artifact_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub state: UploadState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<AttemptRecord>,
}

impl UploadTask {
    pub fn new(
        session_id: SessionId,
        owner: String,
        artifact_path: PathBuf,
        size: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let remote_path = remote_path(&owner, &session_id);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            owner,
            artifact_path,
            remote_path,
            size,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
            state: UploadState::Pending,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    /// Active and past its backoff
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_active() && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Dead-lettered because its local artifact failed verification
    pub fn is_corrupt_dead_letter(&self) -> bool {
        self.state == UploadState::DeadLetter
            && self
                .history
                .last()
                .is_some_and(|record| record.outcome == AttemptOutcome::Corrupt)
    }

    pub fn corrupt_attempts(&self) -> usize {
        self.history
            .iter()
            .filter(|record| record.outcome == AttemptOutcome::Corrupt)
            .count()
    }
}

/// Remote object path for a session's artifact
pub fn remote_path(owner: &str, session_id: &SessionId) -> String {
    format!("{}/{}.bin", owner, session_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    /// Reset the attempt budget and schedule immediately
    Retry,
    /// Delete the artifact and mark the task resolved
    Discard,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<UploadState>,
    pub session_id: Option<SessionId>,
    pub owner: Option<String>,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn state(state: UploadState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn matches(&self, task: &UploadTask) -> bool {
        self.state.is_none_or(|s| s == task.state)
            && self.session_id.as_ref().is_none_or(|id| *id == task.session_id)
            && self.owner.as_deref().is_none_or(|o| o == task.owner)
    }
}
