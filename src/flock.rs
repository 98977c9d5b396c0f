use crate::error::Result;
use crate::Error;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

pub const LOCK_FILE: &str = "kb.lock";

/// Exclusive lock on a knowledge-base directory.
///
/// Held for as long as a [`crate::KnowledgeBase`] is open on the directory.
/// The lock file records the owner's process id; it is left behind on
/// release.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `dir`, creating it if needed. Fails immediately if another
    /// handle holds the lock.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::LockError)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        // The in-process guard of KnowledgeBase still applies
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_lock_records_owner() {
        let dir = tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_lock_fails() {
        let dir = tempdir().unwrap();
        let _lock = DirLock::acquire(dir.path()).unwrap();

        assert!(matches!(
            DirLock::acquire(dir.path()),
            Err(Error::LockError(_))
        ));
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempdir().unwrap();
        {
            let _lock = DirLock::acquire(dir.path()).unwrap();
        }
        let lock = DirLock::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn test_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let _lock = DirLock::acquire(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
