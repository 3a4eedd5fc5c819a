use std::sync::Arc;

use anyhow::{bail, Error};

use pve_storage_api_types::StorageConfig;
use pve_storage_buildcfg::{REMOTE_COMMAND_TIMEOUT, VOLUME_TRANSFER_TIMEOUT};
use pve_storage_tools::{run_command_timeout, run_pipeline};

use crate::cluster::ClusterInfo;
use crate::migration::{zfs_send_pipeline, Target};
use crate::plugin::volume_dataset;

/// Moves replication snapshots to the target node.
///
/// The volume lives under the same storage ID and volume name on both nodes.
pub trait ReplicaTransport: Send + Sync {
    /// Send snapshot `snap` of a volume, incremental starting at `from` if set.
    ///
    /// `rate` is a bandwidth limit in bytes per second.
    fn send_snapshot(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        target_node: &str,
        from: Option<&str>,
        snap: &str,
        rate: Option<u64>,
    ) -> Result<(), Error>;

    /// Remove snapshots of a volume on the target node. Missing snapshots are not an error.
    fn delete_remote_snapshots(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        target_node: &str,
        snapshots: &[String],
    ) -> Result<(), Error>;
}

// 1: dataset or snapshot does not exist
fn destroy_exit_ok(code: i32) -> bool {
    code == 0 || code == 1
}

/// `zfs send | ssh zfs recv` based transport.
pub struct SshTransport {
    cluster: Arc<dyn ClusterInfo>,
}

impl SshTransport {
    pub fn new(cluster: Arc<dyn ClusterInfo>) -> Self {
        Self { cluster }
    }

    fn target(&self, node: &str) -> Result<Target, Error> {
        Ok(Target::Remote {
            node: node.to_string(),
            ip: self.cluster.remote_node_ip(node)?,
        })
    }
}

impl ReplicaTransport for SshTransport {
    fn send_snapshot(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        target_node: &str,
        from: Option<&str>,
        snap: &str,
        rate: Option<u64>,
    ) -> Result<(), Error> {
        let dataset = volume_dataset(scfg, volname)?;
        let target = self.target(target_node)?;

        log::info!(
            "send {}@{} to node '{}'{}",
            dataset,
            snap,
            target_node,
            from.map(|from| format!(" (incremental from {})", from))
                .unwrap_or_default(),
        );

        run_pipeline(
            zfs_send_pipeline(&dataset, from, snap, false, &target, &dataset, rate),
            Some(VOLUME_TRANSFER_TIMEOUT),
        )
    }

    fn delete_remote_snapshots(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        target_node: &str,
        snapshots: &[String],
    ) -> Result<(), Error> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let dataset = volume_dataset(scfg, volname)?;
        let target = self.target(target_node)?;

        let mut errors = Vec::new();
        for snap in snapshots {
            let mut destroy = target.command("/sbin/zfs");
            destroy.args(["destroy", &format!("{}@{}", dataset, snap)]);
            if let Err(err) = run_command_timeout(destroy, REMOTE_COMMAND_TIMEOUT, Some(destroy_exit_ok)) {
                errors.push(format!("{} - {}", snap, err));
            }
        }

        if !errors.is_empty() {
            bail!(
                "removing snapshots of {} on node '{}' failed: {}",
                dataset,
                target_node,
                errors.join(", ")
            );
        }
        Ok(())
    }
}
