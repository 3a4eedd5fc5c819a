//! Storage plugin contract and registry.
//!
//! Every backend implements [`StoragePlugin`]. The engine only ever talks to
//! backends through this trait, selected by the storage type of the
//! configuration entry via the [`PluginRegistry`].

use std::collections::{BTreeSet, HashMap};

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;

use pve_storage_api_types::{
    ContentType, StorageConfig, StorageError, StorageType, VolumeFeature, VolumeFormat, VolumeInfo,
    VolumeName, MAX_DISK_INDEX,
};
use pve_storage_config::ClusterFilesystem;
use pve_storage_tools::task::WorkerTaskContext;

use crate::worker::WorkerJob;

pub mod file_based;

mod cifs;
mod dir;
mod lvm;
mod nfs;
mod zfspool;

pub use file_based::{FileBackend, FileBasedPlugin};
pub use lvm::LvmPlugin;
pub use zfspool::{volume_dataset, ZfsPoolPlugin};

/// Static properties of a backend.
#[derive(Debug)]
pub struct PluginData {
    /// Content types the backend can store.
    pub content: &'static [ContentType],
    /// Content types enabled when the configuration does not say otherwise.
    pub default_content: &'static [ContentType],
    /// Supported image formats, the first one is the default.
    pub formats: &'static [VolumeFormat],
    /// Options which cannot be changed after the storage was created.
    pub fixed_options: &'static [&'static str],
}

impl PluginData {
    pub fn default_format(&self) -> Option<VolumeFormat> {
        self.formats.first().copied()
    }
}

/// Result of [`StoragePlugin::path`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumePath {
    /// Device node, file path or backend specific URI.
    pub path: String,
    /// Owner of the volume.
    pub vmid: Option<u32>,
    pub vtype: ContentType,
}

/// Result of [`StoragePlugin::volume_size_info`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeSize {
    /// Size in bytes.
    pub size: u64,
    pub format: Option<VolumeFormat>,
    /// Used bytes.
    pub used: u64,
    /// Backing volume of linked clones, backend specific.
    pub parent: Option<String>,
}

/// Result of [`StoragePlugin::status`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PluginStatus {
    pub total: u64,
    pub avail: u64,
    pub used: u64,
    pub active: bool,
}

/// Which state of a volume a feature is queried for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureKey {
    /// A snapshot of the volume.
    Snap,
    /// A base volume.
    Base,
    /// The current state of a normal volume.
    Current,
}

impl FeatureKey {
    pub fn new(is_base: bool, snapname: Option<&str>) -> Self {
        if snapname.is_some() {
            FeatureKey::Snap
        } else if is_base {
            FeatureKey::Base
        } else {
            FeatureKey::Current
        }
    }
}

/// The storage backend contract.
///
/// All methods get the typed configuration entry of the storage they act on,
/// the storage ID is part of it. Volume names are backend specific, volume IDs
/// (`<storeid>:<volname>`) are only built by the engine.
pub trait StoragePlugin: Send + Sync {
    fn storage_type(&self) -> StorageType;

    fn plugin_data(&self) -> &'static PluginData;

    /// Parse a volume name of this backend.
    fn parse_volname(&self, volname: &str) -> Result<VolumeName, Error>;

    /// Access path of a volume (or one of its snapshots).
    ///
    /// Pure computation, the volume does not need to exist.
    fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snapname: Option<&str>,
    ) -> Result<VolumePath, Error>;

    /// List disk images, optionally only those of `vmid` or only those in `vollist` (volume IDs).
    fn list_images(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<Vec<VolumeInfo>, Error>;

    /// List volumes of the given content types.
    fn list_volumes(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        content: &BTreeSet<ContentType>,
    ) -> Result<Vec<VolumeInfo>, Error> {
        if !content.contains(&ContentType::Images) && !content.contains(&ContentType::Rootdir) {
            return Ok(Vec::new());
        }
        let mut list = self.list_images(scfg, vmid, None)?;
        list.retain(|info| content.contains(&info.content));
        Ok(list)
    }

    /// Allocate a new volume of `size` KiB and return its volume name.
    ///
    /// Without `name` the backend picks the next free disk name for `vmid`.
    fn alloc_image(
        &self,
        scfg: &StorageConfig,
        vmid: u32,
        format: VolumeFormat,
        name: Option<&str>,
        size: u64,
    ) -> Result<String, Error>;

    /// Remove a volume.
    ///
    /// Slow parts of the removal are returned as worker job, to be run in the background.
    fn free_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        is_base: bool,
        format: Option<VolumeFormat>,
    ) -> Result<Option<WorkerJob>, Error>;

    /// Convert a volume into a base volume, returns the new volume name.
    fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String, Error>;

    /// Create a linked clone for `vmid`, returns the new volume name.
    fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snapname: Option<&str>,
    ) -> Result<String, Error>;

    fn volume_size_info(&self, scfg: &StorageConfig, volname: &str) -> Result<VolumeSize, Error>;

    /// Grow a volume to `size` bytes.
    fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
        running: bool,
    ) -> Result<(), Error>;

    fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str)
        -> Result<(), Error>;

    fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<(), Error>;

    /// Snapshots which prevent a rollback to `snap` (empty if the rollback is possible).
    fn volume_rollback_blockers(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _snap: &str,
    ) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }

    fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
        running: bool,
    ) -> Result<(), Error>;

    /// Snapshots of a volume, oldest first.
    fn volume_snapshot_list(&self, scfg: &StorageConfig, volname: &str)
        -> Result<Vec<String>, Error>;

    fn volume_has_feature(
        &self,
        scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snapname: Option<&str>,
        running: bool,
    ) -> Result<bool, Error>;

    /// Rename a volume, possibly assigning it to another guest. Returns the new volume name.
    fn volume_rename(
        &self,
        _scfg: &StorageConfig,
        _source_volname: &str,
        _target_vmid: u32,
        _target_volname: Option<&str>,
    ) -> Result<String, Error> {
        bail!("rename is not implemented for storage type '{}'", self.storage_type());
    }

    /// Make the storage usable on this node (mount, create directories, ...).
    fn activate_storage(&self, scfg: &StorageConfig, task: &dyn WorkerTaskContext)
        -> Result<(), Error>;

    fn deactivate_storage(&self, _scfg: &StorageConfig) -> Result<(), Error> {
        Ok(())
    }

    fn activate_volume(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _snapname: Option<&str>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn deactivate_volume(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _snapname: Option<&str>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn status(&self, scfg: &StorageConfig) -> Result<PluginStatus, Error>;

    /// Whether the backend (server, device) is reachable.
    ///
    /// `Ok(false)` means not reachable. Timeouts are returned as error.
    fn check_connection(&self, _scfg: &StorageConfig) -> Result<bool, Error> {
        Ok(true)
    }

    /// Called before a new storage is added to the configuration.
    fn on_add_hook(
        &self,
        _scfg: &StorageConfig,
        _password: Option<&str>,
        _cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Called after a storage was removed from the configuration.
    fn on_delete_hook(
        &self,
        _scfg: &StorageConfig,
        _cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Maps storage types to their backend implementation.
pub struct PluginRegistry {
    plugins: HashMap<StorageType, Box<dyn StoragePlugin>>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Registry with all builtin backends.
    pub fn with_default_plugins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(FileBasedPlugin::new(dir::DirBackend)));
        registry.register(Box::new(FileBasedPlugin::new(nfs::NfsBackend)));
        registry.register(Box::new(FileBasedPlugin::new(cifs::CifsBackend)));
        registry.register(Box::new(LvmPlugin));
        registry.register(Box::new(ZfsPoolPlugin));
        registry
    }

    /// Register a backend, replacing any previous one for the same storage type.
    pub fn register(&mut self, plugin: Box<dyn StoragePlugin>) {
        self.plugins.insert(plugin.storage_type(), plugin);
    }

    pub fn lookup(&self, storage_type: StorageType) -> Result<&dyn StoragePlugin, Error> {
        match self.plugins.get(&storage_type) {
            Some(plugin) => Ok(plugin.as_ref()),
            None => Err(StorageError::Config(format!(
                "no plugin registered for storage type '{}'",
                storage_type
            ))
            .into()),
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_default_plugins()
    }
}

lazy_static! {
    static ref DISK_NUMBER_REGEX: Regex =
        Regex::new(r"(?:vm|base|subvol|basevol)-(\d+)-disk-(\d+)(?:\.\S+)?$").unwrap();
}

/// Find the next free disk name for `vmid`.
///
/// `disk_list` contains the names (or volume IDs) of the existing volumes of the storage.
pub fn get_next_vm_diskname<S: AsRef<str>>(
    disk_list: &[S],
    storeid: &str,
    vmid: u32,
    format: Option<VolumeFormat>,
    add_fmt_suffix: bool,
) -> Result<String, Error> {
    let prefix = match format {
        Some(VolumeFormat::Subvol) => "subvol",
        _ => "vm",
    };
    let suffix = match (add_fmt_suffix, format) {
        (true, Some(format)) => format!(".{}", format),
        _ => String::new(),
    };

    let mut used = BTreeSet::new();
    for disk in disk_list {
        if let Some(caps) = DISK_NUMBER_REGEX.captures(disk.as_ref()) {
            if caps[1].parse::<u32>().ok() != Some(vmid) {
                continue;
            }
            if let Ok(index) = caps[2].parse::<u32>() {
                used.insert(index);
            }
        }
    }

    for index in 0..MAX_DISK_INDEX {
        if !used.contains(&index) {
            return Ok(format!("{}-{}-disk-{}{}", prefix, vmid, index, suffix));
        }
    }

    bail!(
        "unable to allocate an image name for VM {} in storage '{}'",
        vmid,
        storeid
    );
}

/// Check a user supplied volume name for a new image of `vmid`.
pub fn check_new_image_name(name: &str, vmid: u32) -> Result<(), Error> {
    let valid = ["vm", "subvol"].iter().any(|prefix| {
        name.strip_prefix(&format!("{}-{}-", prefix, vmid))
            .map(|rest| !rest.is_empty())
            .unwrap_or(false)
    });
    if !valid || name.contains('/') || name.chars().any(char::is_whitespace) {
        return Err(StorageError::Parse(format!(
            "illegal name '{}' - should be 'vm-{}-*'",
            name, vmid
        ))
        .into());
    }
    Ok(())
}

/// Convert an image size in KiB to bytes.
pub fn image_size_bytes(size_kib: u64) -> Result<u64, StorageError> {
    size_kib.checked_mul(1024).ok_or_else(|| {
        StorageError::InvariantViolation(format!("image size of {} KiB is too large", size_kib))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_image_size_bytes() {
        assert_eq!(image_size_bytes(4).unwrap(), 4096);
        assert!(matches!(
            image_size_bytes(u64::MAX),
            Err(StorageError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_next_vm_diskname() -> Result<(), Error> {
        let disks = [
            "100/vm-100-disk-0.raw",
            "100/vm-100-disk-1.qcow2",
            "101/vm-101-disk-2.raw",
            "100/base-100-disk-3.raw",
        ];

        assert_eq!(
            get_next_vm_diskname(&disks, "local", 100, Some(VolumeFormat::Raw), true)?,
            "vm-100-disk-2.raw"
        );
        assert_eq!(
            get_next_vm_diskname(&disks, "local", 101, Some(VolumeFormat::Subvol), false)?,
            "subvol-101-disk-0"
        );
        assert_eq!(
            get_next_vm_diskname::<&str>(&[], "local-zfs", 200, None, false)?,
            "vm-200-disk-0"
        );

        let full: Vec<String> = (0..MAX_DISK_INDEX)
            .map(|i| format!("vm-100-disk-{}", i))
            .collect();
        assert!(get_next_vm_diskname(&full, "local", 100, None, false).is_err());

        Ok(())
    }

    #[test]
    fn test_check_new_image_name() {
        assert!(check_new_image_name("vm-100-disk-5.raw", 100).is_ok());
        assert!(check_new_image_name("subvol-100-disk-0", 100).is_ok());
        assert!(check_new_image_name("vm-101-disk-0", 100).is_err());
        assert!(check_new_image_name("vm-100-", 100).is_err());
        assert!(check_new_image_name("vm-100-a/b", 100).is_err());
    }
}
