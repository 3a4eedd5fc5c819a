use anyhow::Error;

use pve_storage_api_types::StorageConfig;
use pve_storage_buildcfg::STORAGE_LOCK_TIMEOUT;
use pve_storage_tools::lock::{open_file_locked, FileLockGuard};

use super::StorageContext;

impl StorageContext {
    /// Lock a storage for volume creation and removal.
    ///
    /// Shared storages are locked cluster wide, so two nodes never compute the
    /// same free disk name. Local storages only need a node local lock.
    pub fn lock_storage(&self, scfg: &StorageConfig) -> Result<FileLockGuard, Error> {
        if scfg.is_shared() {
            self.cluster_fs()
                .lock_file(&format!("storage-{}", scfg.id()), STORAGE_LOCK_TIMEOUT)
        } else {
            open_file_locked(
                self.lock_dir.join(format!("pve-storage-{}", scfg.id())),
                STORAGE_LOCK_TIMEOUT,
                true,
            )
        }
    }

    /// Run `func` while holding the storage lock.
    pub fn with_storage_lock<T, F>(&self, scfg: &StorageConfig, func: F) -> Result<T, Error>
    where
        F: FnOnce() -> Result<T, Error>,
    {
        let _guard = self.lock_storage(scfg)?;
        func()
    }
}
