//! Crash-safe whole-file replacement
//!
//! Manifests, chunks, checkpoints, upload tasks and artifacts are all written
//! the same way: into `<name>.tmp`, fsynced, renamed over `<name>`, then the
//! directory is fsynced. A crash leaves either the old file or the new one,
//! plus at worst a stray temp file that recovery deletes.

use crate::error::StorageResult;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of in-progress writes
pub const TEMP_SUFFIX: &str = ".tmp";

/// Removes the temp file unless the write was published
struct PendingFile {
    path: PathBuf,
    published: bool,
}

impl Drop for PendingFile {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    PathBuf::from(temp)
}

/// Replace `path` with `data`, creating parent directories as needed
pub fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> StorageResult<()> {
    let path = path.as_ref();
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let mut pending = PendingFile {
        path: temp_path_for(path),
        published: false,
    };
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&pending.path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&pending.path, path)?;
    pending.published = true;

    if let Some(parent) = parent {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Directories cannot be opened for syncing on Windows
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TEMP_SUFFIX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let manifest = temp_dir.path().join("manifest.json");

        write_atomic(&manifest, b"{\"owner\":\"athlete\"}").unwrap();

        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "{\"owner\":\"athlete\"}"
        );
        assert!(!temp_path_for(&manifest).exists());
    }

    #[test]
    fn test_write_creates_session_directory() {
        let temp_dir = TempDir::new().unwrap();
        let chunk = temp_dir.path().join("session/chunk-00000001.pchk");

        write_atomic(&chunk, b"PCHK").unwrap();
        assert!(chunk.exists());
    }

    #[test]
    fn test_rewrite_replaces_previous_checkpoint() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint = temp_dir.path().join("checkpoint-00000001.json");

        write_atomic(&checkpoint, b"{\"is_final\":false}").unwrap();
        write_atomic(&checkpoint, b"{\"is_final\":true}").unwrap();

        assert_eq!(
            fs::read_to_string(&checkpoint).unwrap(),
            "{\"is_final\":true}"
        );
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        // A directory cannot be replaced by a file
        let target = temp_dir.path().join("occupied");
        fs::create_dir_all(target.join("child")).unwrap();

        assert!(write_atomic(&target, b"artifact").is_err());
        assert!(!temp_path_for(&target).exists());
    }

    #[test]
    fn test_temp_file_detection() {
        assert!(is_temp_file(Path::new("/a/chunk-00000002.pchk.tmp")));
        assert!(!is_temp_file(Path::new("/a/chunk-00000002.pchk")));
    }
}
