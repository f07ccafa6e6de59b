//! Durable task records
//!
//! One JSON file per task under `{artifact_dir}/tasks/`, replaced atomically on
//! every state change so a crash leaves either the old or the new record.

use crate::error::UploadResult;
use crate::task::UploadTask;
use pacer_storage::write_atomic;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const TASK_DIR: &str = "tasks";

#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn open(artifact_dir: &Path) -> UploadResult<Self> {
        let dir = artifact_dir.join(TASK_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", task_id))
    }

    pub fn save(&self, task: &UploadTask) -> UploadResult<()> {
        let json = serde_json::to_vec_pretty(task)?;
        write_atomic(self.path(&task.id), &json)?;
        Ok(())
    }

    pub fn remove(&self, task_id: &str) -> UploadResult<()> {
        match fs::remove_file(self.path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable task; unreadable records are logged and skipped
    pub fn load_all(&self) -> UploadResult<Vec<UploadTask>> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read(&path)
                .map_err(|e| e.to_string())
                .and_then(|data| {
                    serde_json::from_slice::<UploadTask>(&data).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(task) => tasks.push(task),
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "Skipping unreadable upload task");
                }
            }
        }
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pacer_core::SessionId;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_remove() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        let task = UploadTask::new(
            SessionId::generate(),
            "athlete".to_string(),
            dir.path().join("a.fit"),
            42,
            Utc::now(),
        );

        store.save(&task).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![task.clone()]);

        store.remove(&task.id).unwrap();
        store.remove(&task.id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_records_are_skipped() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::open(dir.path()).unwrap();
        fs::write(store.dir().join("broken.json"), b"{not json").unwrap();
        fs::write(store.dir().join("notes.txt"), b"ignored").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
