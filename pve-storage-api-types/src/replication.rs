use serde::{Deserialize, Serialize};

use proxmox_schema::{api, IntegerSchema, Schema};

use crate::{BANDWIDTH_LIMIT_SCHEMA, NODE_SCHEMA, VMID_SCHEMA};

/// Prefix of snapshots created by the replication engine.
pub const REPLICA_SNAPSHOT_PREFIX: &str = "replica_";

pub const REPLICATION_INTERVAL_SCHEMA: Schema =
    IntegerSchema::new("Replication interval in minutes.")
        .minimum(1)
        .maximum(60 * 24 * 365)
        .default(15)
        .schema();

/// Snapshot name for replication timestamp `time`.
pub fn replica_snapshot_name(time: i64) -> String {
    format!("{}{}", REPLICA_SNAPSHOT_PREFIX, time)
}

/// Extract the timestamp from a replication snapshot name.
///
/// Returns `None` for all other snapshots.
pub fn parse_replica_snapshot(name: &str) -> Option<i64> {
    let time = name.strip_prefix(REPLICA_SNAPSHOT_PREFIX)?;
    if time.is_empty() || !time.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    time.parse().ok()
}

#[api]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Replication job state.
pub enum ReplicationState {
    /// Last sync succeeded (or there was none yet).
    #[default]
    Ok,
    /// A sync is running, or a sync process died.
    Sync,
    /// Too many consecutive failures, needs operator attention.
    Error,
    /// Job disabled.
    Off,
}

serde_plain::derive_display_from_serialize!(ReplicationState);
serde_plain::derive_fromstr_from_deserialize!(ReplicationState);

fn is_zero(v: &u64) -> bool {
    *v == 0
}

#[api(
    properties: {
        target: { schema: NODE_SCHEMA },
        interval: { schema: REPLICATION_INTERVAL_SCHEMA },
        rate: { schema: BANDWIDTH_LIMIT_SCHEMA, optional: true },
        state: { type: ReplicationState },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Persistent replication job state of a guest.
pub struct ReplicationJob {
    pub target: String,
    pub interval: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u64>,
    /// Timestamp of the last successful sync (0 if there was none).
    #[serde(default)]
    pub lastsync: i64,
    #[serde(default)]
    pub state: ReplicationState,
    /// Consecutive failures.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub fail: u64,
    /// Message of the last error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Duration of the last sync in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl ReplicationJob {
    pub fn new<S: Into<String>>(target: S, interval: u64, rate: Option<u64>) -> Self {
        Self {
            target: target.into(),
            interval,
            rate,
            lastsync: 0,
            state: ReplicationState::Ok,
            fail: 0,
            error: None,
            duration: None,
        }
    }

    /// Whether a scheduled run is due at `now`.
    pub fn is_due(&self, now: i64) -> bool {
        match self.state {
            ReplicationState::Off | ReplicationState::Error => false,
            _ => self.lastsync + (self.interval as i64) * 60 <= now,
        }
    }
}

#[api(
    properties: {
        vmid: { schema: VMID_SCHEMA },
        job: { type: ReplicationJob },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Replication job status as reported by `job_status`.
pub struct ReplicationJobStatus {
    pub vmid: u32,
    #[serde(flatten)]
    pub job: ReplicationJob,
    /// State says `sync`, but no sync process holds the guest lock.
    #[serde(default)]
    pub stale: bool,
}
