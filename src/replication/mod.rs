//! Snapshot based incremental replication of guest volumes to another node.
//!
//! Every sync takes a `replica_<time>` snapshot of all replicated volumes of
//! a guest and sends it to the target node, incremental to the snapshot of
//! the previous sync. After a successful sync only the newest replication
//! snapshot is kept on both sides.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, format_err, Error};
use serde_json::Value;

use proxmox_section_config::SectionConfigData;

use pve_storage_api_types::{
    parse_replica_snapshot, parse_volume_id, replica_snapshot_name, ReplicationJob,
    ReplicationJobStatus, ReplicationState, StorageConfig, StorageError, VolumeFeature,
};
use pve_storage_buildcfg::{
    REPLICA_ADMIN_LOCK_TIMEOUT, REPLICA_MAX_FAIL_COUNT, REPLICA_SYNC_LOCK_TIMEOUT,
};
use pve_storage_tools::task::{try_best_effort, WorkerTaskContext};
use pve_storage_tools::{task_error, task_log, task_warn};

use crate::cluster::{ClusterInfo, GuestType};
use crate::StorageContext;

mod guest;
mod state;
mod transport;

pub use guest::GuestAccessor;
pub use state::{ReplicationJobs, ReplicationStateStore};
pub use transport::{ReplicaTransport, SshTransport};

/// A volume taking part in a sync.
struct ReplicaVolume {
    volid: String,
    scfg: StorageConfig,
    volname: String,
}

/// Runs and administrates the replication jobs of this node.
pub struct ReplicationEngine {
    ctx: Arc<StorageContext>,
    cluster: Arc<dyn ClusterInfo>,
    transport: Arc<dyn ReplicaTransport>,
    guests: BTreeMap<GuestType, Arc<dyn GuestAccessor>>,
    state: ReplicationStateStore,
}

impl ReplicationEngine {
    pub fn new(
        ctx: Arc<StorageContext>,
        cluster: Arc<dyn ClusterInfo>,
        transport: Arc<dyn ReplicaTransport>,
        state: ReplicationStateStore,
    ) -> Self {
        Self {
            ctx,
            cluster,
            transport,
            guests: BTreeMap::new(),
            state,
        }
    }

    /// Register the accessor for one guest type.
    pub fn register_guest(&mut self, accessor: Arc<dyn GuestAccessor>) {
        self.guests.insert(accessor.guest_type(), accessor);
    }

    pub fn state_store(&self) -> &ReplicationStateStore {
        &self.state
    }

    /// Accessor for a guest which must live on this node.
    fn local_guest(&self, vmid: u32) -> Result<Arc<dyn GuestAccessor>, Error> {
        let vmlist = self.cluster.get_vmlist()?;
        let entry = vmlist
            .get(&vmid)
            .ok_or_else(|| format_err!("guest {} does not exist", vmid))?;

        if entry.node != self.cluster.local_node() {
            bail!("guest {} is not running on this node (node '{}')", vmid, entry.node);
        }

        self.guests
            .get(&entry.guest_type)
            .cloned()
            .ok_or_else(|| format_err!("no accessor for guest type '{}'", entry.guest_type))
    }

    /// Resolve the replicated volumes of a guest, skipping those which can't be replicated.
    fn replica_volumes(
        &self,
        cfg: &SectionConfigData,
        guest: &dyn GuestAccessor,
        vmid: u32,
        task: &dyn WorkerTaskContext,
    ) -> Result<Vec<ReplicaVolume>, Error> {
        let config = guest.load_config(vmid)?;
        let mut volumes = Vec::new();

        for volid in guest.get_replicatable_volumes(cfg, vmid, &config)? {
            if !self
                .ctx
                .volume_has_feature(cfg, VolumeFeature::Replicate, &volid, None, false)?
            {
                task_warn!(task, "skipping volume '{}' - replication is not supported", volid);
                continue;
            }
            let (scfg, volname, _) = self.ctx.parse_volname(cfg, &volid)?;
            volumes.push(ReplicaVolume {
                volid,
                scfg,
                volname,
            });
        }

        Ok(volumes)
    }

    /// Storages must be usable on this node and the target node.
    fn check_storages(
        &self,
        cfg: &SectionConfigData,
        volumes: &[ReplicaVolume],
        target: &str,
    ) -> Result<(), Error> {
        let storeids: BTreeSet<&str> = volumes.iter().map(|volume| volume.scfg.id()).collect();
        for storeid in storeids {
            self.ctx.storage_check_enabled(cfg, storeid, None)?;
            self.ctx.storage_check_enabled(cfg, storeid, Some(target))?;
        }
        Ok(())
    }

    /// Replicate the volumes of guest `vmid` now.
    ///
    /// Returns the timestamp of the new replication snapshot. Failures are
    /// counted in the job state, after [`REPLICA_MAX_FAIL_COUNT`] consecutive
    /// failures the job enters the `error` state.
    pub fn sync_guest(&self, vmid: u32, task: &dyn WorkerTaskContext) -> Result<i64, Error> {
        let _guest_lock = self.state.guest_lock(vmid, REPLICA_SYNC_LOCK_TIMEOUT)?;

        let job = self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
            let job = jobs
                .get_mut(&vmid)
                .ok_or_else(|| format_err!("no replication job for guest {}", vmid))?;
            if job.state == ReplicationState::Off {
                bail!("replication job for guest {} is disabled", vmid);
            }
            job.state = ReplicationState::Sync;
            Ok(job.clone())
        })?;

        let start = Instant::now();

        match self.do_sync(vmid, &job, task) {
            Ok(time) => {
                self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
                    if let Some(job) = jobs.get_mut(&vmid) {
                        job.lastsync = time;
                        // disabled while running
                        if job.state != ReplicationState::Off {
                            job.state = ReplicationState::Ok;
                        }
                        job.fail = 0;
                        job.error = None;
                        job.duration = Some(start.elapsed().as_secs_f64());
                    }
                    Ok(())
                })?;
                task_log!(task, "replication of guest {} finished", vmid);
                Ok(time)
            }
            Err(err) => {
                let update = self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
                    if let Some(job) = jobs.get_mut(&vmid) {
                        job.fail += 1;
                        if job.state != ReplicationState::Off {
                            job.state = if job.fail >= REPLICA_MAX_FAIL_COUNT {
                                ReplicationState::Error
                            } else {
                                ReplicationState::Ok
                            };
                        }
                        job.error = Some(err.to_string());
                        job.duration = Some(start.elapsed().as_secs_f64());
                    }
                    Ok(())
                });
                if let Err(update_err) = update {
                    task_warn!(task, "unable to record replication failure - {}", update_err);
                }
                task_error!(task, "replication of guest {} failed - {}", vmid, err);
                Err(err)
            }
        }
    }

    fn do_sync(&self, vmid: u32, job: &ReplicationJob, task: &dyn WorkerTaskContext) -> Result<i64, Error> {
        let (cfg, _digest) = self.ctx.read_config()?;
        let guest = self.local_guest(vmid)?;

        let volumes = self.replica_volumes(&cfg, guest.as_ref(), vmid, task)?;
        self.check_storages(&cfg, &volumes, &job.target)?;

        let time = proxmox_time::epoch_i64().max(job.lastsync + 1);
        let snap = replica_snapshot_name(time);
        let last_snap = (job.lastsync > 0).then(|| replica_snapshot_name(job.lastsync));

        task_log!(task, "start replication of guest {} to node '{}'", vmid, job.target);

        let frozen = try_best_effort(task, "freeze guest filesystem", || {
            guest.freeze_filesystem(vmid)
        })
        .is_some();

        let snapshot_result = self.snapshot_all(&cfg, &volumes, &snap, task);

        if frozen {
            try_best_effort(task, "thaw guest filesystem", || guest.thaw_filesystem(vmid));
        }
        snapshot_result?;

        for volume in &volumes {
            task_log!(task, "send '{}' ({})", volume.volid, snap);
            let result = self
                .transport
                .send_snapshot(
                    &volume.scfg,
                    &volume.volname,
                    &job.target,
                    last_snap.as_deref(),
                    &snap,
                    job.rate,
                )
                .map_err(|err| -> Error {
                    StorageError::Transport(format!("sending '{}' failed - {}", volume.volid, err)).into()
                });

            if let Err(err) = result {
                for volume in &volumes {
                    try_best_effort(task, "removing new local snapshot", || {
                        self.ctx.volume_snapshot_delete(&cfg, &volume.volid, &snap, false)
                    });
                    try_best_effort(task, "removing new remote snapshot", || {
                        self.transport.delete_remote_snapshots(
                            &volume.scfg,
                            &volume.volname,
                            &job.target,
                            &[snap.clone()],
                        )
                    });
                }
                return Err(err);
            }
        }

        if let Some(last_snap) = &last_snap {
            for volume in &volumes {
                try_best_effort(task, "removing previous local replication snapshot", || {
                    self.ctx.volume_snapshot_delete(&cfg, &volume.volid, last_snap, false)
                });
                try_best_effort(task, "removing previous remote replication snapshot", || {
                    self.transport.delete_remote_snapshots(
                        &volume.scfg,
                        &volume.volname,
                        &job.target,
                        &[last_snap.clone()],
                    )
                });
            }
        }

        Ok(time)
    }

    /// Snapshot all volumes, or none.
    fn snapshot_all(
        &self,
        cfg: &SectionConfigData,
        volumes: &[ReplicaVolume],
        snap: &str,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let mut done: Vec<&ReplicaVolume> = Vec::new();

        for volume in volumes {
            if let Err(err) = self.ctx.volume_snapshot(cfg, &volume.volid, snap) {
                for taken in done {
                    try_best_effort(task, "removing replication snapshot", || {
                        self.ctx.volume_snapshot_delete(cfg, &taken.volid, snap, false)
                    });
                }
                return Err(format_err!(
                    "snapshot of '{}' failed - {}",
                    volume.volid,
                    err
                ));
            }
            done.push(volume);
        }

        Ok(())
    }

    /// Newest replication snapshot present on all volumes.
    fn common_replica_snapshot(&self, cfg: &SectionConfigData, volumes: &[ReplicaVolume]) -> Result<i64, Error> {
        let mut common: Option<BTreeSet<i64>> = None;

        for volume in volumes {
            let times: BTreeSet<i64> = self
                .ctx
                .volume_snapshot_list(cfg, &volume.volid)?
                .iter()
                .filter_map(|snap| parse_replica_snapshot(snap))
                .collect();
            common = Some(match common {
                Some(common) => common.intersection(&times).copied().collect(),
                None => times,
            });
        }

        Ok(common
            .and_then(|times| times.iter().next_back().copied())
            .unwrap_or(0))
    }

    /// Enable replication of guest `vmid` to `target` and run the first sync.
    ///
    /// Replication snapshots left over from an earlier job to the same target
    /// are picked up, so the first sync can be incremental.
    pub fn job_enable(
        &self,
        vmid: u32,
        target: &str,
        interval: u64,
        rate: Option<u64>,
        task: &dyn WorkerTaskContext,
    ) -> Result<i64, Error> {
        if target == self.cluster.local_node() {
            return Err(StorageError::Config(format!(
                "unable to replicate guest {} to the local node",
                vmid
            ))
            .into());
        }

        let guest = self.local_guest(vmid)?;
        let (cfg, _digest) = self.ctx.read_config()?;

        let volumes = self.replica_volumes(&cfg, guest.as_ref(), vmid, task)?;
        self.check_storages(&cfg, &volumes, target)?;
        let recovered = self.common_replica_snapshot(&cfg, &volumes)?;

        self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
            let job = jobs
                .entry(vmid)
                .or_insert_with(|| ReplicationJob::new(target, interval, rate));

            if job.target != target {
                *job = ReplicationJob::new(target, interval, rate);
            }
            job.interval = interval;
            job.rate = rate;
            if matches!(job.state, ReplicationState::Off | ReplicationState::Error) {
                job.state = ReplicationState::Ok;
                job.fail = 0;
                job.error = None;
            }
            if job.lastsync == 0 && recovered > 0 {
                task_log!(task, "found replication snapshot from {}", recovered);
                job.lastsync = recovered;
            }
            Ok(())
        })?;

        let mut config = guest.load_config(vmid)?;
        set_replicate_flag(&mut config, true)?;
        guest.write_config(vmid, &config)?;

        self.sync_guest(vmid, task)
    }

    /// Stop running the job, keeping its state and snapshots.
    pub fn job_disable(&self, vmid: u32) -> Result<(), Error> {
        self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
            let job = jobs
                .get_mut(&vmid)
                .ok_or_else(|| format_err!("no replication job for guest {}", vmid))?;
            job.state = ReplicationState::Off;
            Ok(())
        })
    }

    /// Remove the job and all replication snapshots on both nodes.
    pub fn job_remove(&self, vmid: u32, task: &dyn WorkerTaskContext) -> Result<(), Error> {
        let _guest_lock = self.state.guest_lock(vmid, REPLICA_SYNC_LOCK_TIMEOUT)?;

        let job = self
            .state
            .load()?
            .remove(&vmid)
            .ok_or_else(|| format_err!("no replication job for guest {}", vmid))?;

        match self.local_guest(vmid) {
            Ok(guest) => {
                let (cfg, _digest) = self.ctx.read_config()?;
                for volume in self.replica_volumes(&cfg, guest.as_ref(), vmid, task)? {
                    self.remove_replica_snapshots(&cfg, &volume, &job.target, task);
                }

                try_best_effort(task, "clearing replicate flag", || {
                    let mut config = guest.load_config(vmid)?;
                    set_replicate_flag(&mut config, false)?;
                    guest.write_config(vmid, &config)
                });
            }
            Err(err) => task_warn!(task, "not removing replication snapshots - {}", err),
        }

        self.state.update(REPLICA_ADMIN_LOCK_TIMEOUT, |jobs| {
            jobs.remove(&vmid);
            Ok(())
        })?;

        task_log!(task, "removed replication job of guest {}", vmid);
        Ok(())
    }

    fn remove_replica_snapshots(
        &self,
        cfg: &SectionConfigData,
        volume: &ReplicaVolume,
        target: &str,
        task: &dyn WorkerTaskContext,
    ) {
        let snapshots: Vec<String> = try_best_effort(task, "listing snapshots", || {
            self.ctx.volume_snapshot_list(cfg, &volume.volid)
        })
        .unwrap_or_default()
        .into_iter()
        .filter(|snap| parse_replica_snapshot(snap).is_some())
        .collect();

        for snap in &snapshots {
            try_best_effort(task, "removing local replication snapshot", || {
                self.ctx.volume_snapshot_delete(cfg, &volume.volid, snap, false)
            });
        }
        try_best_effort(task, "removing remote replication snapshots", || {
            self.transport
                .delete_remote_snapshots(&volume.scfg, &volume.volname, target, &snapshots)
        });
    }

    /// State of all jobs.
    ///
    /// A job in state `sync` whose guest lock is free belongs to a sync which
    /// died; it is reported as stale.
    pub fn job_status(&self) -> Result<Vec<ReplicationJobStatus>, Error> {
        let mut list = Vec::new();
        for (vmid, job) in self.state.load()? {
            let stale =
                job.state == ReplicationState::Sync && self.state.try_guest_lock(vmid)?.is_some();
            list.push(ReplicationJobStatus { vmid, job, stale });
        }
        Ok(list)
    }

    /// Run all jobs of guests on this node which are due at `now`.
    ///
    /// A failing guest does not stop the others. Returns the guests synced successfully.
    pub fn run_due_jobs(&self, now: i64, task: &dyn WorkerTaskContext) -> Result<Vec<u32>, Error> {
        let vmlist = self.cluster.get_vmlist()?;
        let local_node = self.cluster.local_node();

        let due: Vec<u32> = self
            .state
            .load()?
            .into_iter()
            .filter(|(vmid, job)| {
                job.is_due(now)
                    && vmlist
                        .get(vmid)
                        .map(|entry| entry.node == local_node)
                        .unwrap_or(false)
            })
            .map(|(vmid, _)| vmid)
            .collect();

        let mut synced = Vec::new();
        for vmid in due {
            task.check_abort()?;
            match self.sync_guest(vmid, task) {
                Ok(_) => synced.push(vmid),
                Err(err) => task_warn!(task, "replication of guest {} failed - {}", vmid, err),
            }
        }
        Ok(synced)
    }
}

fn set_replicate_flag(config: &mut Value, enabled: bool) -> Result<(), Error> {
    let object = config
        .as_object_mut()
        .ok_or_else(|| format_err!("guest configuration is not an object"))?;
    if enabled {
        object.insert("replicate".to_string(), Value::from(1));
    } else {
        object.remove("replicate");
    }
    Ok(())
}

/// Volume IDs of the volumes a guest config names.
///
/// Helper for [`GuestAccessor`] implementations which keep volume IDs as
/// plain string values.
pub fn config_volume_ids(config: &Value) -> BTreeSet<String> {
    let mut volids = BTreeSet::new();
    if let Some(object) = config.as_object() {
        for value in object.values() {
            if let Some(text) = value.as_str() {
                let volid = text.split(',').next().unwrap_or(text);
                if parse_volume_id(volid).is_ok() {
                    volids.insert(volid.to_string());
                }
            }
        }
    }
    volids
}

#[cfg(test)]
mod test {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_replicate_flag() -> Result<(), Error> {
        let mut config = json!({ "scsi0": "local-zfs:vm-100-disk-0,size=32G" });
        set_replicate_flag(&mut config, true)?;
        assert_eq!(config["replicate"], json!(1));
        set_replicate_flag(&mut config, false)?;
        assert!(config.get("replicate").is_none());

        assert!(set_replicate_flag(&mut json!("scsi0"), true).is_err());
        Ok(())
    }

    #[test]
    fn test_config_volume_ids() {
        let config = json!({
            "scsi0": "local-zfs:vm-100-disk-0,size=32G",
            "scsi1": "tank:vm-100-disk-1",
            "name": "web",
            "cores": 4,
        });
        let volids: Vec<String> = config_volume_ids(&config).into_iter().collect();
        assert_eq!(volids, vec!["local-zfs:vm-100-disk-0", "tank:vm-100-disk-1"]);
    }
}
