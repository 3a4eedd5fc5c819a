//! Paths, lock names and timeouts shared by the storage crates.

use std::time::Duration;

/// The clustered configuration file system mount point
pub const CLUSTER_CONFIG_DIR: &str = "/etc/pve";

#[macro_export]
macro_rules! PVE_STORAGE_LOCK_DIR_M {
    () => {
        "/var/lock/pve-manager"
    };
}

#[macro_export]
macro_rules! PVE_REPLICA_STATE_DIR_M {
    () => {
        "/var/lib/pve-replica"
    };
}

/// node local lock directory (used for storages which are not shared)
pub const PVE_STORAGE_LOCK_DIR: &str = PVE_STORAGE_LOCK_DIR_M!();

/// persistent replication state
pub const PVE_REPLICA_STATE_DIR: &str = PVE_REPLICA_STATE_DIR_M!();

/// the replication job state file, relative to [`PVE_REPLICA_STATE_DIR`]
pub const PVE_REPLICA_STATE_FILENAME: &str = "pve-replica.state";

/// Storage configuration, relative to the cluster file system root.
pub const STORAGE_CFG_FILENAME: &str = "storage.cfg";

/// Name of the lock protecting `storage.cfg` (cluster wide).
pub const STORAGE_CFG_LOCKNAME: &str = "file-storage_cfg";

/// Directory for storage credentials, relative to the cluster file system root.
pub const STORAGE_PRIV_DIR: &str = "priv/storage";

/// Default timeout to acquire the storage configuration lock
pub const STORAGE_CFG_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for per storage locks (allocation, free, clone, ...)
pub const STORAGE_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for replication state changes issued by an administrator
pub const REPLICA_ADMIN_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the per guest replication lock held during a sync
pub const REPLICA_SYNC_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of consecutive failures after which a replication job enters the error state
pub const REPLICA_MAX_FAIL_COUNT: u64 = 3;

/// Timeout for short running backend queries (`zfs list`, `vgs`, `qemu-img info`, ...)
pub const BACKEND_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for copying or sending a single volume to another node
pub const VOLUME_TRANSFER_TIMEOUT: Duration = Duration::from_secs(24 * 3600);

/// Timeout for short commands run on another node over ssh
pub const REMOTE_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
