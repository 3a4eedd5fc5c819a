//! Volume lifecycle engine.
//!
//! [`StorageContext`] bundles everything the engine needs (plugin registry,
//! cluster file system, node name, lock directory, task executor) and is
//! passed explicitly to every entry point. Operations resolve the volume ID,
//! check that the storage is enabled on this node, activate it and then
//! dispatch to the backend plugin, holding the storage lock where volumes
//! are created or removed.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};

use proxmox_section_config::SectionConfigData;

use pve_storage_api_types::{
    format_content_list, parse_volume_id, ContentType, StorageConfig, StorageError,
    StorageStatus, VolumeName,
};
use pve_storage_buildcfg::PVE_STORAGE_LOCK_DIR;
use pve_storage_config::storage::{lookup_storage, storage_list};
use pve_storage_config::ClusterFilesystem;
use pve_storage_tools::task::LogTaskContext;

use crate::plugin::{PluginRegistry, StoragePlugin};
use crate::worker::{InlineExecutor, TaskExecutor};

mod config;
mod lock;
mod prune;
mod relationships;
mod volume;

pub use relationships::linked_clones;

/// Shared state of all storage operations on one node.
pub struct StorageContext {
    registry: PluginRegistry,
    cluster_fs: Arc<dyn ClusterFilesystem>,
    node: String,
    lock_dir: PathBuf,
    executor: Arc<dyn TaskExecutor>,
    activated: Mutex<HashSet<String>>,
}

impl StorageContext {
    pub fn new<S: Into<String>>(
        registry: PluginRegistry,
        cluster_fs: Arc<dyn ClusterFilesystem>,
        node: S,
    ) -> Self {
        Self {
            registry,
            cluster_fs,
            node: node.into(),
            lock_dir: PathBuf::from(PVE_STORAGE_LOCK_DIR),
            executor: Arc::new(InlineExecutor),
            activated: Mutex::new(HashSet::new()),
        }
    }

    /// Use another directory for node local storage locks.
    pub fn with_lock_dir<P: Into<PathBuf>>(mut self, lock_dir: P) -> Self {
        self.lock_dir = lock_dir.into();
        self
    }

    /// Use another executor for background jobs (volume removal, ...).
    pub fn with_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn cluster_fs(&self) -> &dyn ClusterFilesystem {
        self.cluster_fs.as_ref()
    }

    pub fn executor(&self) -> &dyn TaskExecutor {
        self.executor.as_ref()
    }

    /// Read the current storage configuration (data and digest).
    pub fn read_config(&self) -> Result<(SectionConfigData, [u8; 32]), Error> {
        pve_storage_config::storage::config(self.cluster_fs())
    }

    /// Plugin implementing the type of `scfg`.
    pub fn plugin_for(&self, scfg: &StorageConfig) -> Result<&dyn StoragePlugin, Error> {
        self.registry.lookup(scfg.storage_type())
    }

    /// Lookup a storage and make sure it may be used on `node` (defaults to this node).
    pub fn storage_check_enabled(
        &self,
        cfg: &SectionConfigData,
        storeid: &str,
        node: Option<&str>,
    ) -> Result<StorageConfig, Error> {
        let scfg = lookup_storage(cfg, storeid)?;

        if scfg.is_disabled() {
            return Err(StorageError::Config(format!("storage '{}' is disabled", storeid)).into());
        }

        let node = node.unwrap_or(&self.node);
        if !scfg.common().available_on(node) {
            return Err(StorageError::Config(format!(
                "storage '{}' is not available on node '{}'",
                storeid, node
            ))
            .into());
        }

        Ok(scfg)
    }

    /// Resolve a volume ID into storage configuration and parsed volume name.
    pub fn parse_volname(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
    ) -> Result<(StorageConfig, String, VolumeName), Error> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let scfg = lookup_storage(cfg, &storeid)?;
        let info = self.plugin_for(&scfg)?.parse_volname(&volname)?;
        Ok((scfg, volname, info))
    }

    /// Activate a storage, unless already done by this context.
    pub fn activate_storage(&self, cfg: &SectionConfigData, storeid: &str) -> Result<(), Error> {
        let scfg = self.storage_check_enabled(cfg, storeid, None)?;

        if self.is_activated(storeid) {
            return Ok(());
        }

        let plugin = self.plugin_for(&scfg)?;

        if !plugin.check_connection(&scfg)? {
            return Err(StorageError::BackendUnavailable {
                storeid: storeid.to_string(),
                reason: "storage is not online".to_string(),
            }
            .into());
        }

        let task = LogTaskContext::new(format!("activate {}", storeid));
        plugin.activate_storage(&scfg, &task)?;

        if let Ok(mut activated) = self.activated.lock() {
            activated.insert(storeid.to_string());
        }
        Ok(())
    }

    fn is_activated(&self, storeid: &str) -> bool {
        self.activated
            .lock()
            .map(|activated| activated.contains(storeid))
            .unwrap_or(false)
    }

    pub fn activate_storage_list<S: AsRef<str>>(
        &self,
        cfg: &SectionConfigData,
        storeids: &[S],
    ) -> Result<(), Error> {
        for storeid in storeids {
            self.activate_storage(cfg, storeid.as_ref())?;
        }
        Ok(())
    }

    pub fn deactivate_storage(&self, cfg: &SectionConfigData, storeid: &str) -> Result<(), Error> {
        let scfg = lookup_storage(cfg, storeid)?;
        self.plugin_for(&scfg)?.deactivate_storage(&scfg)?;

        if let Ok(mut activated) = self.activated.lock() {
            activated.remove(storeid);
        }
        Ok(())
    }

    /// Activate the storages of all volumes, then the volumes themselves.
    pub fn activate_volumes<S: AsRef<str>>(
        &self,
        cfg: &SectionConfigData,
        volids: &[S],
        snapname: Option<&str>,
    ) -> Result<(), Error> {
        let mut storeids = BTreeSet::new();
        for volid in volids {
            let (storeid, _) = parse_volume_id(volid.as_ref())?;
            storeids.insert(storeid);
        }
        for storeid in &storeids {
            self.activate_storage(cfg, storeid)?;
        }

        for volid in volids {
            let (scfg, volname, _) = self.parse_volname(cfg, volid.as_ref())?;
            self.plugin_for(&scfg)?
                .activate_volume(&scfg, &volname, snapname)?;
        }
        Ok(())
    }

    /// Deactivate volumes. All volumes are tried, failures are reported together.
    pub fn deactivate_volumes<S: AsRef<str>>(
        &self,
        cfg: &SectionConfigData,
        volids: &[S],
        snapname: Option<&str>,
    ) -> Result<(), Error> {
        let mut errors = Vec::new();

        for volid in volids {
            let volid = volid.as_ref();
            let result = self.parse_volname(cfg, volid).and_then(|(scfg, volname, _)| {
                self.plugin_for(&scfg)?
                    .deactivate_volume(&scfg, &volname, snapname)
            });
            if let Err(err) = result {
                log::error!("deactivate volume '{}' failed - {}", volid, err);
                errors.push(format!("{} - {}", volid, err));
            }
        }

        if !errors.is_empty() {
            bail!("volume deactivation failed: {}", errors.join(", "));
        }
        Ok(())
    }

    /// Status of all storages enabled on this node, optionally only those supporting `content`.
    pub fn storage_status(
        &self,
        cfg: &SectionConfigData,
        content: Option<ContentType>,
    ) -> Result<Vec<StorageStatus>, Error> {
        let mut list = Vec::new();

        for scfg in storage_list(cfg)? {
            if scfg.is_disabled() || !scfg.common().available_on(&self.node) {
                continue;
            }

            let plugin = match self.plugin_for(&scfg) {
                Ok(plugin) => plugin,
                Err(err) => {
                    log::warn!("{}", err);
                    continue;
                }
            };

            let content_types = self.content_types(&scfg, plugin)?;
            if let Some(content) = content {
                if !content_types.contains(&content) {
                    continue;
                }
            }

            let mut status = StorageStatus {
                storage: scfg.id().to_string(),
                ty: scfg.storage_type(),
                content: format_content_list(&content_types),
                shared: scfg.is_shared(),
                enabled: true,
                active: false,
                total: 0,
                used: 0,
                avail: 0,
            };

            let result = self
                .activate_storage(cfg, scfg.id())
                .and_then(|_| plugin.status(&scfg));

            match result {
                Ok(plugin_status) => {
                    status.active = plugin_status.active;
                    status.total = plugin_status.total;
                    status.used = plugin_status.used;
                    status.avail = plugin_status.avail;
                }
                Err(err) => log::warn!("could not get status of storage '{}' - {}", scfg.id(), err),
            }

            list.push(status);
        }

        Ok(list)
    }

    /// Configured content types, or the plugin defaults.
    pub fn content_types(
        &self,
        scfg: &StorageConfig,
        plugin: &dyn StoragePlugin,
    ) -> Result<BTreeSet<ContentType>, Error> {
        Ok(match scfg.common().content_types()? {
            Some(content) => content,
            None => plugin.plugin_data().default_content.iter().copied().collect(),
        })
    }

    /// Storages enabled on this node, in configuration order.
    fn enabled_storages(&self, cfg: &SectionConfigData) -> Result<Vec<StorageConfig>, Error> {
        Ok(storage_list(cfg)?
            .into_iter()
            .filter(|scfg| !scfg.is_disabled() && scfg.common().available_on(&self.node))
            .collect())
    }
}
