// shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, format_err, Error};
use serde_json::Value;

use proxmox_section_config::SectionConfigData;

use pve_storage::cluster::{ClusterInfo, GuestType, VmListEntry};
use pve_storage::plugin::{
    get_next_vm_diskname, PluginData, PluginRegistry, PluginStatus, StoragePlugin, VolumePath,
    VolumeSize,
};
use pve_storage::replication::{config_volume_ids, GuestAccessor, ReplicaTransport};
use pve_storage::worker::{TaskExecutor, WorkerJob};
use pve_storage::StorageContext;
use pve_storage_api_types::volume::parse_pool_volname;
use pve_storage_api_types::{
    ContentType, StorageConfig, StorageType, VolumeFeature, VolumeFormat, VolumeInfo, VolumeName,
};
use pve_storage_config::{ClusterFilesystem, LocalClusterFs};
use pve_storage_tools::task::WorkerTaskContext;

pub const LOCAL_NODE: &str = "node1";
pub const TARGET_NODE: &str = "node2";

/// Task context collecting all log lines.
#[derive(Default)]
pub struct TestTask {
    pub lines: Mutex<Vec<(log::Level, String)>>,
}

impl TestTask {
    pub fn warnings(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level <= log::Level::Warn)
            .map(|(_, line)| line.clone())
            .collect()
    }
}

impl WorkerTaskContext for TestTask {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }
}

/// A storage context on top of a temporary cluster file system.
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<StorageContext>,
}

impl TestEnv {
    pub fn new(storage_cfg: &str, registry: PluginRegistry) -> Result<Self, Error> {
        Self::with_executor(storage_cfg, registry, None)
    }

    pub fn with_executor(
        storage_cfg: &str,
        registry: PluginRegistry,
        executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<Self, Error> {
        let dir = tempfile::tempdir()?;
        let fs = LocalClusterFs::new(dir.path().join("cluster"));
        fs.write_file("storage.cfg", storage_cfg.as_bytes())?;

        let mut ctx = StorageContext::new(registry, Arc::new(fs), LOCAL_NODE)
            .with_lock_dir(dir.path().join("lock"));
        if let Some(executor) = executor {
            ctx = ctx.with_executor(executor);
        }

        Ok(Self {
            dir,
            ctx: Arc::new(ctx),
        })
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn config(&self) -> Result<SectionConfigData, Error> {
        Ok(self.ctx.read_config()?.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemVolume {
    /// Size in bytes.
    pub size: u64,
    pub snapshots: Vec<String>,
}

#[derive(Default)]
pub struct MemPoolState {
    pub volumes: BTreeMap<String, MemVolume>,
    /// Volume on which snapshots fail.
    pub fail_snapshot: Option<String>,
    /// Hand out removal as worker job instead of removing right away.
    pub deferred_free: bool,
}

const MEM_POOL_DATA: PluginData = PluginData {
    content: &[ContentType::Images, ContentType::Rootdir],
    default_content: &[ContentType::Images, ContentType::Rootdir],
    formats: &[VolumeFormat::Raw, VolumeFormat::Subvol],
    fixed_options: &["pool"],
};

/// In-memory pool with ZFS like volume names and snapshot semantics.
///
/// Registered as `zfspool` plugin.
#[derive(Clone, Default)]
pub struct MemPoolPlugin {
    pub state: Arc<Mutex<MemPoolState>>,
}

impl MemPoolPlugin {
    pub fn registry(&self) -> PluginRegistry {
        let mut registry = PluginRegistry::with_default_plugins();
        registry.register(Box::new(self.clone()));
        registry
    }

    pub fn add_volume(&self, volname: &str, size: u64) {
        self.state.lock().unwrap().volumes.insert(
            volname.to_string(),
            MemVolume {
                size,
                snapshots: Vec::new(),
            },
        );
    }

    pub fn snapshots(&self, volname: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(volname)
            .map(|volume| volume.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn exists(&self, volname: &str) -> bool {
        self.state.lock().unwrap().volumes.contains_key(volname)
    }

    fn with_volume<T, F>(&self, volname: &str, func: F) -> Result<T, Error>
    where
        F: FnOnce(&mut MemVolume) -> Result<T, Error>,
    {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get_mut(volname)
            .ok_or_else(|| format_err!("volume '{}' does not exist", volname))?;
        func(volume)
    }
}

impl StoragePlugin for MemPoolPlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::ZfsPool
    }

    fn plugin_data(&self) -> &'static PluginData {
        &MEM_POOL_DATA
    }

    fn parse_volname(&self, volname: &str) -> Result<VolumeName, Error> {
        Ok(parse_pool_volname(volname)?)
    }

    fn path(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        _snapname: Option<&str>,
    ) -> Result<VolumePath, Error> {
        let info = self.parse_volname(volname)?;
        Ok(VolumePath {
            path: format!("/dev/mem/{}", volname),
            vmid: info.vmid,
            vtype: info.vtype,
        })
    }

    fn list_images(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeInfo>, Error> {
        let state = self.state.lock().unwrap();
        let mut list = Vec::new();
        for (volname, volume) in state.volumes.iter() {
            let info = self.parse_volname(volname)?;
            let volid = format!("{}:{}", scfg.id(), volname);
            if vmid.is_some() && info.vmid != vmid {
                continue;
            }
            if let Some(vollist) = vollist {
                if !vollist.contains(&volid) {
                    continue;
                }
            }
            let mut entry = VolumeInfo::new(volid, ContentType::Images, volume.size);
            entry.vmid = info.vmid;
            entry.format = info.format;
            entry.parent = info.basename;
            list.push(entry);
        }
        Ok(list)
    }

    fn alloc_image(
        &self,
        scfg: &StorageConfig,
        vmid: u32,
        format: VolumeFormat,
        name: Option<&str>,
        size: u64,
    ) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let names: Vec<&String> = state.volumes.keys().collect();
                get_next_vm_diskname(&names, scfg.id(), vmid, Some(format), false)?
            }
        };
        if state.volumes.contains_key(&name) {
            bail!("volume '{}' already exists", name);
        }
        state.volumes.insert(
            name.clone(),
            MemVolume {
                size: size * 1024,
                snapshots: Vec::new(),
            },
        );
        Ok(name)
    }

    fn free_image(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        _is_base: bool,
        _format: Option<VolumeFormat>,
    ) -> Result<Option<WorkerJob>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.contains_key(volname) {
            bail!("volume '{}' does not exist", volname);
        }
        if !state.deferred_free {
            state.volumes.remove(volname);
            return Ok(None);
        }

        let shared = Arc::clone(&self.state);
        let volname = volname.to_string();
        Ok(Some(WorkerJob::new("imgdel", Some(volname.clone()), move |_task| {
            shared.lock().unwrap().volumes.remove(&volname);
            Ok(())
        })))
    }

    fn create_base(&self, _scfg: &StorageConfig, volname: &str) -> Result<String, Error> {
        let info = self.parse_volname(volname)?;
        if info.is_base {
            bail!("volume '{}' is already a base volume", volname);
        }
        let newname = volname.replacen("vm-", "base-", 1);
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .remove(volname)
            .ok_or_else(|| format_err!("volume '{}' does not exist", volname))?;
        state.volumes.insert(newname.clone(), volume);
        Ok(newname)
    }

    fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        _snapname: Option<&str>,
    ) -> Result<String, Error> {
        let info = self.parse_volname(volname)?;
        if !info.is_base {
            bail!("clone_image only works on base images");
        }
        let mut state = self.state.lock().unwrap();
        let size = state
            .volumes
            .get(volname)
            .map(|volume| volume.size)
            .ok_or_else(|| format_err!("volume '{}' does not exist", volname))?;
        let names: Vec<&String> = state.volumes.keys().collect();
        let name = get_next_vm_diskname(&names, scfg.id(), vmid, Some(VolumeFormat::Raw), false)?;
        let clone = format!("{}/{}", volname, name);
        state.volumes.insert(
            clone.clone(),
            MemVolume {
                size,
                snapshots: Vec::new(),
            },
        );
        Ok(clone)
    }

    fn volume_size_info(&self, _scfg: &StorageConfig, volname: &str) -> Result<VolumeSize, Error> {
        self.with_volume(volname, |volume| {
            Ok(VolumeSize {
                size: volume.size,
                format: Some(VolumeFormat::Raw),
                used: volume.size,
                parent: None,
            })
        })
    }

    fn volume_resize(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        size: u64,
        _running: bool,
    ) -> Result<(), Error> {
        self.with_volume(volname, |volume| {
            volume.size = size;
            Ok(())
        })
    }

    fn volume_snapshot(&self, _scfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), Error> {
        if self.state.lock().unwrap().fail_snapshot.as_deref() == Some(volname) {
            bail!("snapshot failed (injected)");
        }
        self.with_volume(volname, |volume| {
            if volume.snapshots.iter().any(|s| s == snap) {
                bail!("snapshot '{}' already exists", snap);
            }
            volume.snapshots.push(snap.to_string());
            Ok(())
        })
    }

    fn volume_snapshot_rollback(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<(), Error> {
        self.with_volume(volname, |volume| {
            let pos = volume
                .snapshots
                .iter()
                .position(|s| s == snap)
                .ok_or_else(|| format_err!("snapshot '{}' does not exist", snap))?;
            volume.snapshots.truncate(pos + 1);
            Ok(())
        })
    }

    fn volume_rollback_blockers(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<Vec<String>, Error> {
        self.with_volume(volname, |volume| {
            let pos = volume
                .snapshots
                .iter()
                .position(|s| s == snap)
                .ok_or_else(|| format_err!("snapshot '{}' does not exist", snap))?;
            Ok(volume.snapshots[pos + 1..].to_vec())
        })
    }

    fn volume_snapshot_delete(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        snap: &str,
        _running: bool,
    ) -> Result<(), Error> {
        self.with_volume(volname, |volume| {
            let before = volume.snapshots.len();
            volume.snapshots.retain(|s| s != snap);
            if volume.snapshots.len() == before {
                bail!("snapshot '{}' does not exist", snap);
            }
            Ok(())
        })
    }

    fn volume_snapshot_list(&self, _scfg: &StorageConfig, volname: &str) -> Result<Vec<String>, Error> {
        self.with_volume(volname, |volume| Ok(volume.snapshots.clone()))
    }

    fn volume_has_feature(
        &self,
        _scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snapname: Option<&str>,
        _running: bool,
    ) -> Result<bool, Error> {
        let info = self.parse_volname(volname)?;
        Ok(match feature {
            VolumeFeature::Snapshot | VolumeFeature::Replicate => !info.is_base,
            VolumeFeature::Clone => info.is_base,
            VolumeFeature::Template => !info.is_base && snapname.is_none(),
            VolumeFeature::Rename => !info.is_base && snapname.is_none(),
            VolumeFeature::Copy | VolumeFeature::Sparseinit => true,
        })
    }

    fn activate_storage(&self, _scfg: &StorageConfig, _task: &dyn WorkerTaskContext) -> Result<(), Error> {
        Ok(())
    }

    fn status(&self, _scfg: &StorageConfig) -> Result<PluginStatus, Error> {
        let used = self
            .state
            .lock()
            .unwrap()
            .volumes
            .values()
            .map(|volume| volume.size)
            .sum();
        Ok(PluginStatus {
            total: 1 << 40,
            avail: (1 << 40) - used,
            used,
            active: true,
        })
    }
}

/// Static cluster: all guests live on [`LOCAL_NODE`].
pub struct TestCluster {
    pub vmlist: BTreeMap<u32, VmListEntry>,
}

impl TestCluster {
    pub fn with_guests(guests: &[(u32, GuestType)]) -> Self {
        let vmlist = guests
            .iter()
            .map(|(vmid, guest_type)| {
                (
                    *vmid,
                    VmListEntry {
                        guest_type: *guest_type,
                        node: LOCAL_NODE.to_string(),
                    },
                )
            })
            .collect();
        Self { vmlist }
    }
}

impl ClusterInfo for TestCluster {
    fn local_node(&self) -> &str {
        LOCAL_NODE
    }

    fn get_vmlist(&self) -> Result<BTreeMap<u32, VmListEntry>, Error> {
        Ok(self.vmlist.clone())
    }

    fn remote_node_ip(&self, node: &str) -> Result<String, Error> {
        match node {
            TARGET_NODE => Ok("10.0.0.2".to_string()),
            _ => bail!("unknown node '{}'", node),
        }
    }
}

/// Guest configurations kept in memory; all volumes named in the config are replicated.
#[derive(Default)]
pub struct TestGuests {
    pub configs: Mutex<BTreeMap<u32, Value>>,
}

impl GuestAccessor for TestGuests {
    fn guest_type(&self) -> GuestType {
        GuestType::Qemu
    }

    fn load_config(&self, vmid: u32) -> Result<Value, Error> {
        self.configs
            .lock()
            .unwrap()
            .get(&vmid)
            .cloned()
            .ok_or_else(|| format_err!("no config for guest {}", vmid))
    }

    fn write_config(&self, vmid: u32, config: &Value) -> Result<(), Error> {
        self.configs.lock().unwrap().insert(vmid, config.clone());
        Ok(())
    }

    fn get_replicatable_volumes(
        &self,
        _storage_cfg: &SectionConfigData,
        _vmid: u32,
        config: &Value,
    ) -> Result<BTreeSet<String>, Error> {
        Ok(config_volume_ids(config))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentSnapshot {
    pub volname: String,
    pub from: Option<String>,
    pub snap: String,
}

/// Records sends, optionally failing them.
#[derive(Default)]
pub struct TestTransport {
    pub sent: Mutex<Vec<SentSnapshot>>,
    pub deleted: Mutex<Vec<(String, String)>>,
    pub fail: Mutex<bool>,
    /// Runs once, at the start of the next send.
    pub during_send: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl TestTransport {
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn on_next_send<F: FnOnce() + Send + 'static>(&self, func: F) {
        *self.during_send.lock().unwrap() = Some(Box::new(func));
    }
}

impl ReplicaTransport for TestTransport {
    fn send_snapshot(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        _target_node: &str,
        from: Option<&str>,
        snap: &str,
        _rate: Option<u64>,
    ) -> Result<(), Error> {
        let during_send = self.during_send.lock().unwrap().take();
        if let Some(func) = during_send {
            func();
        }
        if *self.fail.lock().unwrap() {
            bail!("connection refused");
        }
        self.sent.lock().unwrap().push(SentSnapshot {
            volname: volname.to_string(),
            from: from.map(String::from),
            snap: snap.to_string(),
        });
        Ok(())
    }

    fn delete_remote_snapshots(
        &self,
        _scfg: &StorageConfig,
        volname: &str,
        _target_node: &str,
        snapshots: &[String],
    ) -> Result<(), Error> {
        let mut deleted = self.deleted.lock().unwrap();
        for snap in snapshots {
            deleted.push((volname.to_string(), snap.clone()));
        }
        Ok(())
    }
}

pub fn dir_storage_cfg(path: &Path) -> String {
    format!(
        "dir: dir1\n\tpath {}\n\tcontent images,rootdir,backup\n",
        path.display()
    )
}

pub const POOL_STORAGE_CFG: &str = "zfspool: tank\n\tpool tank/data\n\tcontent images,rootdir\n";

/// Collects spawned jobs without running them.
#[derive(Default)]
pub struct QueueExecutor {
    pub jobs: Mutex<Vec<WorkerJob>>,
}

impl TaskExecutor for QueueExecutor {
    fn spawn(&self, job: WorkerJob) -> Result<String, Error> {
        let upid = format!("{}:{}", job.worker_type(), job.worker_id().unwrap_or(""));
        self.jobs.lock().unwrap().push(job);
        Ok(upid)
    }
}
