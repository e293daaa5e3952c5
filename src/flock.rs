use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::error::Result;
use crate::Error;

pub const LOCK_FILE: &str = "cinder.lck";

/// Exclusive lock on an environment directory, held for the environment's lifetime.
///
/// The lock is released by the OS when the file handle closes, so dropping the
/// guard is enough. The lock file itself is left in place.
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Locks `dir`, writing the owning process id into the lock file.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file).map_err(Error::Lock)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> std::io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let result = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_writes_pid() -> Result<()> {
        let dir = TempDir::new()?;
        let lock = DirLock::acquire(dir.path())?;

        assert_eq!(lock.path(), dir.path().join(LOCK_FILE));
        let content = std::fs::read_to_string(lock.path())?;
        assert!(content.contains(&std::process::id().to_string()));

        Ok(())
    }

    #[test]
    fn test_double_lock_fails() -> Result<()> {
        let dir = TempDir::new()?;
        let _first = DirLock::acquire(dir.path())?;

        let second = DirLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::Lock(_))));

        Ok(())
    }

    #[test]
    fn test_lock_released_on_drop() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let _lock = DirLock::acquire(dir.path())?;
        }
        let _again = DirLock::acquire(dir.path())?;

        Ok(())
    }
}
