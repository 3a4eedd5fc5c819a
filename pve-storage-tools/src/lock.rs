//! Advisory file locks with a bounded wait.
//!
//! Locks are `flock(2)` locks taken through [`proxmox_sys::fs::lock_file`].
//! A lock which cannot be acquired in time always ends in
//! [`StorageError::LockTimeout`] instead of blocking forever.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::Duration;

use anyhow::{format_err, Error};

use pve_storage_api_types::StorageError;

/// Holds a file lock until dropped.
pub struct FileLockGuard(#[allow(dead_code)] File);

fn open_lock_file(path: &Path) -> Result<File, Error> {
    if let Some(parent) = path.parent() {
        proxmox_sys::fs::create_path(parent, None, None)
            .map_err(|err| format_err!("unable to create lock dir {:?} - {}", parent, err))?;
    }

    OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .map_err(|err| format_err!("unable to open lock file {:?} - {}", path, err))
}

/// Lock an already opened file. The file is known to be a regular, open lock
/// file, so any failure means the lock is held by somebody else.
fn lock_opened(
    path: &Path,
    mut file: File,
    timeout: Duration,
    exclusive: bool,
) -> Result<FileLockGuard, StorageError> {
    match proxmox_sys::fs::lock_file(&mut file, exclusive, Some(timeout)) {
        Ok(()) => Ok(FileLockGuard(file)),
        Err(err) => {
            log::debug!("unable to acquire lock {:?} - {}", path, err);
            Err(StorageError::LockTimeout {
                lock: path.display().to_string(),
                timeout: timeout.as_secs(),
            })
        }
    }
}

/// Open or create a lock file and lock it, waiting at most `timeout`.
pub fn open_file_locked<P: AsRef<Path>>(
    path: P,
    timeout: Duration,
    exclusive: bool,
) -> Result<FileLockGuard, Error> {
    let path = path.as_ref();
    let file = open_lock_file(path)?;
    Ok(lock_opened(path, file, timeout, exclusive)?)
}

/// Try to lock a file without waiting.
///
/// Returns `None` if somebody else holds the lock.
pub fn try_lock_file<P: AsRef<Path>>(
    path: P,
    exclusive: bool,
) -> Result<Option<FileLockGuard>, Error> {
    let path = path.as_ref();
    let file = open_lock_file(path)?;
    Ok(lock_opened(path, file, Duration::ZERO, exclusive).ok())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lock_timeout() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sub/test.lck");

        let _guard = open_file_locked(&path, Duration::from_secs(1), true)?;

        // flock locks are per open file description, so a second open conflicts
        let err = match open_file_locked(&path, Duration::from_millis(100), true) {
            Ok(_) => panic!("lock acquired twice"),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockTimeout { .. })
        ));

        assert!(try_lock_file(&path, true)?.is_none());
        drop(_guard);
        assert!(try_lock_file(&path, true)?.is_some());

        Ok(())
    }
}
