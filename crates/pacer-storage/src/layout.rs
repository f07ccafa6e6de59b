//! On-disk layout of one session log
//!
//! ```text
//! {root}/{session_id}/manifest.json
//! {root}/{session_id}/chunk-00000001.pchk
//! {root}/{session_id}/checkpoint-00000001.json
//! {root}/{session_id}/checkpoint-00000007-final.json
//! ```

use pacer_core::SessionId;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Kind of a file found in a session directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFile {
    Manifest,
    Chunk(u64),
    Checkpoint { index: u64, is_final: bool },
}

impl LogFile {
    pub fn parse(name: &str) -> Option<Self> {
        if name == MANIFEST_FILE {
            return Some(LogFile::Manifest);
        }
        if let Some(seq) = name
            .strip_prefix("chunk-")
            .and_then(|rest| rest.strip_suffix(".pchk"))
        {
            return seq.parse().ok().map(LogFile::Chunk);
        }
        let rest = name
            .strip_prefix("checkpoint-")
            .and_then(|rest| rest.strip_suffix(".json"))?;
        let (index, is_final) = match rest.strip_suffix("-final") {
            Some(index) => (index, true),
            None => (rest, false),
        };
        index
            .parse()
            .ok()
            .map(|index| LogFile::Checkpoint { index, is_final })
    }
}

#[derive(Debug, Clone)]
pub struct SessionPaths {
    dir: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &Path, session_id: &SessionId) -> Self {
        Self {
            dir: root.join(session_id.as_str()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifest(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    pub fn chunk(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("chunk-{:08}.pchk", sequence))
    }

    pub fn checkpoint(&self, index: u64, is_final: bool) -> PathBuf {
        if is_final {
            self.dir.join(format!("checkpoint-{:08}-final.json", index))
        } else {
            self.dir.join(format!("checkpoint-{:08}.json", index))
        }
    }
}
