//! Persistent replication job state.
//!
//! All jobs of a node live in one JSON document (`pve-replica.state`),
//! keyed by guest ID. Every change is a read-modify-write cycle under the
//! state lock; a running sync additionally holds the lock of its guest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};
use nix::sys::stat::Mode;

use proxmox_sys::fs::{file_read_optional_string, replace_file, CreateOptions};

use pve_storage_api_types::ReplicationJob;
use pve_storage_buildcfg::{PVE_REPLICA_STATE_DIR, PVE_REPLICA_STATE_FILENAME};
use pve_storage_tools::lock::{open_file_locked, try_lock_file, FileLockGuard};

pub type ReplicationJobs = BTreeMap<u32, ReplicationJob>;

/// Location of the replication state file and its locks.
#[derive(Clone, Debug)]
pub struct ReplicationStateStore {
    dir: PathBuf,
}

impl ReplicationStateStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    /// The state directory of this node.
    pub fn system() -> Self {
        Self::new(PVE_REPLICA_STATE_DIR)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join(PVE_REPLICA_STATE_FILENAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(".pve-replica.lck")
    }

    fn guest_lock_path(&self, vmid: u32) -> PathBuf {
        self.dir.join(format!(".lock-{}", vmid))
    }

    /// Read all jobs. A missing state file means there are no jobs.
    pub fn load(&self) -> Result<ReplicationJobs, Error> {
        let path = self.state_path();
        match file_read_optional_string(&path)? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|err| format_err!("unable to parse {:?} - {}", path, err)),
            _ => Ok(ReplicationJobs::new()),
        }
    }

    fn store(&self, jobs: &ReplicationJobs) -> Result<(), Error> {
        let raw = serde_json::to_string_pretty(jobs)?;
        let options = CreateOptions::new().perm(Mode::from_bits_truncate(0o0600));
        replace_file(self.state_path(), raw.as_bytes(), options, true)
    }

    /// Lock the state, let `func` modify the jobs and write them back.
    ///
    /// Nothing is written if `func` fails.
    pub fn update<T, F>(&self, timeout: Duration, func: F) -> Result<T, Error>
    where
        F: FnOnce(&mut ReplicationJobs) -> Result<T, Error>,
    {
        let _lock = open_file_locked(self.lock_path(), timeout, true)?;
        let mut jobs = self.load()?;
        let result = func(&mut jobs)?;
        self.store(&jobs)?;
        Ok(result)
    }

    /// Serialize syncs of one guest, waiting at most `timeout`.
    pub fn guest_lock(&self, vmid: u32, timeout: Duration) -> Result<FileLockGuard, Error> {
        open_file_locked(self.guest_lock_path(vmid), timeout, true)
    }

    /// Guest lock without waiting, `None` while a sync of this guest runs.
    pub fn try_guest_lock(&self, vmid: u32) -> Result<Option<FileLockGuard>, Error> {
        try_lock_file(self.guest_lock_path(vmid), true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use pve_storage_api_types::ReplicationState;

    #[test]
    fn test_state_roundtrip() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = ReplicationStateStore::new(dir.path());

        assert!(store.load()?.is_empty());

        store.update(Duration::from_secs(1), |jobs| {
            let mut job = ReplicationJob::new("node2", 15, Some(1024));
            job.lastsync = 1700000000;
            jobs.insert(100, job);
            Ok(())
        })?;

        let jobs = store.load()?;
        assert_eq!(jobs[&100].target, "node2");
        assert_eq!(jobs[&100].lastsync, 1700000000);
        assert_eq!(jobs[&100].state, ReplicationState::Ok);

        // failing updates leave the state untouched
        let res: Result<(), Error> = store.update(Duration::from_secs(1), |jobs| {
            jobs.clear();
            anyhow::bail!("abort")
        });
        assert!(res.is_err());
        assert_eq!(store.load()?.len(), 1);

        Ok(())
    }

    #[test]
    fn test_guest_lock() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let store = ReplicationStateStore::new(dir.path());

        let guard = store.guest_lock(100, Duration::from_secs(1))?;
        assert!(store.try_guest_lock(100)?.is_none());
        assert!(store.try_guest_lock(101)?.is_some());
        drop(guard);
        assert!(store.try_guest_lock(100)?.is_some());

        Ok(())
    }
}
