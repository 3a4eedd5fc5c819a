/// Classified storage errors.
///
/// Functions return `anyhow::Error`; use `err.downcast_ref::<StorageError>()`
/// to find out whether a failure is worth retrying.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Malformed configuration, duplicate or missing storage.
    #[error("{0}")]
    Config(String),
    /// The configuration changed since the caller read it.
    #[error("detected modified configuration - file changed by other user? Try again.")]
    DigestMismatch,
    /// A file lock could not be acquired in time. Retrying later may succeed.
    #[error("can't lock '{lock}' - got timeout after {timeout}s")]
    LockTimeout { lock: String, timeout: u64 },
    /// The backend is not reachable, not mounted or the device is missing.
    #[error("storage '{storeid}' is not available - {reason}")]
    BackendUnavailable { storeid: String, reason: String },
    /// A base volume still has linked clones.
    #[error("base volume '{volname}' is still in use by linked clone '{child}'")]
    BaseInUse { volname: String, child: String },
    /// Rollback would destroy newer snapshots.
    #[error("can't rollback to '{snapshot}', newer snapshots exist: {}", blockers.join(", "))]
    RollbackBlocked {
        snapshot: String,
        blockers: Vec<String>,
    },
    /// The operation would break a volume invariant and was not attempted.
    #[error("{0}")]
    InvariantViolation(String),
    /// Data transfer to another storage or node failed.
    #[error("transfer failed - {0}")]
    Transport(String),
    /// A backend command did not finish in time. Retrying later may succeed.
    #[error("command '{command}' timed out after {timeout}s")]
    CommandTimeout { command: String, timeout: u64 },
    /// A volume identifier or name does not match any known grammar.
    #[error("{0}")]
    Parse(String),
    /// Copying between these storage types is not implemented.
    #[error("migration from storage type '{0}' to '{1}' is not supported")]
    UnsupportedMigration(String, String),
}

impl StorageError {
    /// Whether the caller may retry the very same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::LockTimeout { .. } | StorageError::CommandTimeout { .. }
        )
    }
}

#[test]
fn test_retryable() {
    let timeout = StorageError::LockTimeout {
        lock: "file-storage_cfg".to_string(),
        timeout: 10,
    };
    assert!(timeout.is_retryable());
    assert_eq!(
        timeout.to_string(),
        "can't lock 'file-storage_cfg' - got timeout after 10s"
    );

    let blocked = StorageError::RollbackBlocked {
        snapshot: "s1".to_string(),
        blockers: vec!["s2".to_string(), "s3".to_string()],
    };
    assert!(!blocked.is_retryable());
    assert_eq!(
        blocked.to_string(),
        "can't rollback to 's1', newer snapshots exist: s2, s3"
    );

    assert!(!StorageError::DigestMismatch.is_retryable());
}
