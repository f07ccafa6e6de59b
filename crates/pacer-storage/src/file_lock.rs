//! Single-owner lock on the log root
//!
//! Recovery deletes temp files and chunks past their checkpoint, so a second
//! process opening the same root would destroy the first one's work. The
//! owner holds an advisory exclusive lock on `.pacer.lock` and records its pid
//! there for diagnostics.

use crate::error::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE: &str = ".pacer.lock";

/// Held for the lifetime of a `DurableLogStore`; released on drop
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    pub fn try_acquire<P: AsRef<Path>>(root: P) -> StorageResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        let path = root.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if !sys::lock_exclusive(&file)? {
            return Err(StorageError::Locked(root.to_path_buf()));
        }

        // Truncating before the lock is held would wipe the owner's pid
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        debug!(path = %path.display(), "Log root locked");

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // The file stays; removing it would race with the next owner
        let _ = sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use super::*;
    use std::os::unix::io::AsRawFd;

    pub fn lock_exclusive(file: &File) -> io::Result<bool> {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::*;
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::{LockFileEx, UnlockFileEx};
    use winapi::um::minwinbase::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, OVERLAPPED};

    const ERROR_LOCK_VIOLATION: i32 = 33;

    pub fn lock_exclusive(file: &File) -> io::Result<bool> {
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
        if unsafe { LockFileEx(handle as _, flags, 0, !0, !0, &mut overlapped) } != 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_LOCK_VIOLATION) {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn unlock(file: &File) -> io::Result<()> {
        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        if unsafe { UnlockFileEx(handle as _, 0, !0, !0, &mut overlapped) } != 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_has_a_single_owner() {
        let temp_dir = TempDir::new().unwrap();

        let owner = DirLock::try_acquire(temp_dir.path()).unwrap();
        assert!(matches!(
            DirLock::try_acquire(temp_dir.path()),
            Err(StorageError::Locked(_))
        ));

        drop(owner);
        assert!(DirLock::try_acquire(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_lock_file_records_owner_pid() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("logs");

        let lock = DirLock::try_acquire(&root).unwrap();
        let recorded = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(recorded.trim(), std::process::id().to_string());
    }
}
