//! Access to the cluster wide configuration file system.
//!
//! The storage layer does not implement any consensus itself, it relies on a
//! file system which is identical on all nodes and offers cluster wide locks
//! (the pmxcfs mounted at `/etc/pve`). [`LocalClusterFs`] implements the
//! interface on top of a plain directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use nix::sys::stat::Mode;

use proxmox_sys::fs::{replace_file, CreateOptions};

use pve_storage_tools::lock::{open_file_locked, FileLockGuard};

/// Reliable key value store with advisory locks, shared by all cluster nodes.
///
/// Names are relative paths like `storage.cfg` or `priv/storage/nas.pw`.
pub trait ClusterFilesystem: Send + Sync {
    /// Read a file, `None` if it does not exist.
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Atomically replace a file.
    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), Error>;

    /// Remove a file. Removing a file which does not exist is not an error.
    fn remove_file(&self, name: &str) -> Result<(), Error>;

    /// Acquire the cluster wide lock `name`, waiting at most `timeout`.
    ///
    /// Fails with `StorageError::LockTimeout` if the lock is not available in time.
    fn lock_file(&self, name: &str, timeout: Duration) -> Result<FileLockGuard, Error>;
}

fn check_relative_name(name: &str) -> Result<(), Error> {
    if name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|c| c.is_empty() || c == "." || c == "..")
    {
        bail!("invalid cluster file name '{}'", name);
    }
    Ok(())
}

/// Cluster file system rooted at a local directory.
#[derive(Clone, Debug)]
pub struct LocalClusterFs {
    root: PathBuf,
    lock_dir: PathBuf,
}

impl LocalClusterFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let lock_dir = root.join("priv/lock");
        Self { root, lock_dir }
    }

    /// The cluster configuration file system of this node.
    pub fn system() -> Self {
        Self::new(pve_storage_buildcfg::CLUSTER_CONFIG_DIR)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, name: &str) -> Result<PathBuf, Error> {
        check_relative_name(name)?;
        Ok(self.root.join(name))
    }
}

impl ClusterFilesystem for LocalClusterFs {
    fn read_file(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let path = self.file_path(name)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => bail!("unable to read {:?} - {}", path, err),
        }
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<(), Error> {
        let path = self.file_path(name)?;
        if let Some(parent) = path.parent() {
            proxmox_sys::fs::create_path(parent, None, None)
                .map_err(|err| format_err!("unable to create directory {:?} - {}", parent, err))?;
        }

        let mode = if name.starts_with("priv/") { 0o600 } else { 0o640 };
        let options = CreateOptions::new().perm(Mode::from_bits_truncate(mode));

        replace_file(&path, data, options, true)
    }

    fn remove_file(&self, name: &str) -> Result<(), Error> {
        let path = self.file_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => bail!("unable to remove {:?} - {}", path, err),
        }
    }

    fn lock_file(&self, name: &str, timeout: Duration) -> Result<FileLockGuard, Error> {
        check_relative_name(name)?;
        open_file_locked(self.lock_dir.join(name), timeout, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pve_storage_api_types::StorageError;

    #[test]
    fn test_local_cluster_fs() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let fs = LocalClusterFs::new(dir.path());

        assert_eq!(fs.read_file("storage.cfg")?, None);
        fs.write_file("priv/storage/nas.pw", b"secret\n")?;
        assert_eq!(fs.read_file("priv/storage/nas.pw")?.as_deref(), Some(&b"secret\n"[..]));
        fs.remove_file("priv/storage/nas.pw")?;
        fs.remove_file("priv/storage/nas.pw")?;
        assert_eq!(fs.read_file("priv/storage/nas.pw")?, None);

        assert!(fs.read_file("../etc/passwd").is_err());
        assert!(fs.write_file("/etc/passwd", b"").is_err());
        Ok(())
    }

    #[test]
    fn test_cluster_lock() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let fs = LocalClusterFs::new(dir.path());

        let guard = fs.lock_file("file-storage_cfg", Duration::from_secs(1))?;
        let err = fs
            .lock_file("file-storage_cfg", Duration::from_millis(100))
            .err()
            .ok_or_else(|| format_err!("nested lock succeeded"))?;
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::LockTimeout { .. })
        ));

        drop(guard);
        fs.lock_file("file-storage_cfg", Duration::from_secs(1))?;
        Ok(())
    }
}
