//! Volume operations.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Error};
use nix::sys::stat::{umask, Mode};

use proxmox_section_config::SectionConfigData;

use pve_storage_api_types::{
    check_storage_id, parse_volume_id, ContentType, StorageError, VolumeFeature, VolumeFormat,
    VolumeInfo, SNAPSHOT_NAME_REGEX, VMID_MAX, VMID_MIN,
};

use super::{linked_clones, StorageContext};
use crate::plugin::{VolumePath, VolumeSize};

/// Restores the previous umask on drop.
struct UmaskGuard(Mode);

impl UmaskGuard {
    fn new(mask: Mode) -> Self {
        Self(umask(mask))
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        umask(self.0);
    }
}

fn check_vmid(vmid: u32) -> Result<(), Error> {
    if !(VMID_MIN..=VMID_MAX).contains(&vmid) {
        return Err(StorageError::Parse(format!(
            "vmid '{}' out of range ({}-{})",
            vmid, VMID_MIN, VMID_MAX
        ))
        .into());
    }
    Ok(())
}

fn check_snapshot_name(snap: &str) -> Result<(), Error> {
    if !SNAPSHOT_NAME_REGEX.is_match(snap) {
        return Err(StorageError::Parse(format!("invalid snapshot name '{}'", snap)).into());
    }
    Ok(())
}

fn unsupported(feature: VolumeFeature, volid: &str) -> Error {
    StorageError::InvariantViolation(format!(
        "feature '{}' is not available for volume '{}'",
        feature, volid
    ))
    .into()
}

impl StorageContext {
    /// Allocate a new volume of `size` KiB, returns the volume ID.
    pub fn vdisk_alloc(
        &self,
        cfg: &SectionConfigData,
        storeid: &str,
        vmid: u32,
        format: Option<VolumeFormat>,
        name: Option<&str>,
        size: u64,
    ) -> Result<String, Error> {
        check_storage_id(storeid)?;
        check_vmid(vmid)?;

        let scfg = self.storage_check_enabled(cfg, storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;
        let data = plugin.plugin_data();

        let format = match format.or_else(|| scfg.format()).or_else(|| data.default_format()) {
            Some(format) => format,
            None => bail!("storage '{}' does not define a default format", storeid),
        };
        if !data.formats.contains(&format) {
            bail!("unsupported format '{}' for storage '{}'", format, storeid);
        }

        self.activate_storage(cfg, storeid)?;

        let volname = self.with_storage_lock(&scfg, || {
            let _umask = UmaskGuard::new(Mode::from_bits_truncate(0o077));
            plugin.alloc_image(&scfg, vmid, format, name, size)
        })?;

        let volid = format!("{}:{}", storeid, volname);
        log::info!("allocated volume '{}'", volid);
        Ok(volid)
    }

    /// Remove a volume.
    ///
    /// Base volumes are only removed when no linked clone refers to them. Slow
    /// cleanup is handed to the task executor, its task ID is returned.
    pub fn vdisk_free(&self, cfg: &SectionConfigData, volid: &str) -> Result<Option<String>, Error> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let scfg = self.storage_check_enabled(cfg, &storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;
        let info = plugin.parse_volname(&volname)?;

        self.activate_storage(cfg, &storeid)?;

        let job = self.with_storage_lock(&scfg, || {
            if info.is_base {
                if let Some(child) = linked_clones(plugin, &scfg, &info)?.into_iter().next() {
                    return Err(StorageError::BaseInUse {
                        volname: volid.to_string(),
                        child,
                    }
                    .into());
                }
            }
            plugin.free_image(&scfg, &volname, info.is_base, info.format)
        })?;

        log::info!("removed volume '{}'", volid);

        match job {
            Some(job) => Ok(Some(self.executor().spawn(job)?)),
            None => Ok(None),
        }
    }

    /// Create a linked clone of a base volume for `vmid`.
    pub fn vdisk_clone(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        vmid: u32,
        snapname: Option<&str>,
    ) -> Result<String, Error> {
        check_vmid(vmid)?;
        let (storeid, volname) = parse_volume_id(volid)?;
        let scfg = self.storage_check_enabled(cfg, &storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;

        if !plugin.volume_has_feature(&scfg, VolumeFeature::Clone, &volname, snapname, false)? {
            return Err(unsupported(VolumeFeature::Clone, volid));
        }

        self.activate_storage(cfg, &storeid)?;

        let newname = self.with_storage_lock(&scfg, || {
            let _umask = UmaskGuard::new(Mode::from_bits_truncate(0o077));
            plugin.clone_image(&scfg, &volname, vmid, snapname)
        })?;

        Ok(format!("{}:{}", storeid, newname))
    }

    /// Convert a volume into a base volume (irreversible), returns the new volume ID.
    pub fn vdisk_create_base(&self, cfg: &SectionConfigData, volid: &str) -> Result<String, Error> {
        let (storeid, volname) = parse_volume_id(volid)?;
        let scfg = self.storage_check_enabled(cfg, &storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;

        if !plugin.volume_has_feature(&scfg, VolumeFeature::Template, &volname, None, false)? {
            return Err(unsupported(VolumeFeature::Template, volid));
        }

        self.activate_storage(cfg, &storeid)?;

        let newname = self.with_storage_lock(&scfg, || plugin.create_base(&scfg, &volname))?;
        Ok(format!("{}:{}", storeid, newname))
    }

    /// Grow a volume to `size` bytes.
    pub fn volume_resize(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        size: u64,
        running: bool,
    ) -> Result<(), Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        let plugin = self.plugin_for(&scfg)?;

        self.activate_storage(cfg, scfg.id())?;

        let current = plugin.volume_size_info(&scfg, &volname)?;
        if size < current.size {
            return Err(StorageError::InvariantViolation(format!(
                "shrinking volume '{}' is not supported ({} < {})",
                volid, size, current.size
            ))
            .into());
        }

        plugin.volume_resize(&scfg, &volname, size, running)
    }

    pub fn volume_snapshot(&self, cfg: &SectionConfigData, volid: &str, snap: &str) -> Result<(), Error> {
        check_snapshot_name(snap)?;
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        let plugin = self.plugin_for(&scfg)?;

        if !plugin.volume_has_feature(&scfg, VolumeFeature::Snapshot, &volname, None, false)? {
            return Err(unsupported(VolumeFeature::Snapshot, volid));
        }

        self.activate_storage(cfg, scfg.id())?;
        plugin.volume_snapshot(&scfg, &volname, snap)
    }

    /// Fails with [`StorageError::RollbackBlocked`] listing the snapshots a rollback would destroy.
    pub fn volume_rollback_is_possible(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        snap: &str,
    ) -> Result<(), Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        let plugin = self.plugin_for(&scfg)?;

        if !plugin.volume_has_feature(&scfg, VolumeFeature::Snapshot, &volname, Some(snap), false)? {
            return Err(unsupported(VolumeFeature::Snapshot, volid));
        }

        let blockers = plugin.volume_rollback_blockers(&scfg, &volname, snap)?;
        if !blockers.is_empty() {
            return Err(StorageError::RollbackBlocked {
                snapshot: snap.to_string(),
                blockers,
            }
            .into());
        }
        Ok(())
    }

    pub fn volume_snapshot_rollback(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        snap: &str,
    ) -> Result<(), Error> {
        self.volume_rollback_is_possible(cfg, volid, snap)?;

        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.activate_storage(cfg, scfg.id())?;
        self.plugin_for(&scfg)?
            .volume_snapshot_rollback(&scfg, &volname, snap)
    }

    pub fn volume_snapshot_delete(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        snap: &str,
        running: bool,
    ) -> Result<(), Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.activate_storage(cfg, scfg.id())?;
        self.plugin_for(&scfg)?
            .volume_snapshot_delete(&scfg, &volname, snap, running)
    }

    /// Snapshots of a volume, oldest first.
    pub fn volume_snapshot_list(&self, cfg: &SectionConfigData, volid: &str) -> Result<Vec<String>, Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.activate_storage(cfg, scfg.id())?;
        self.plugin_for(&scfg)?.volume_snapshot_list(&scfg, &volname)
    }

    pub fn volume_has_feature(
        &self,
        cfg: &SectionConfigData,
        feature: VolumeFeature,
        volid: &str,
        snapname: Option<&str>,
        running: bool,
    ) -> Result<bool, Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.plugin_for(&scfg)?
            .volume_has_feature(&scfg, feature, &volname, snapname, running)
    }

    pub fn volume_size_info(&self, cfg: &SectionConfigData, volid: &str) -> Result<VolumeSize, Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.activate_storage(cfg, scfg.id())?;
        self.plugin_for(&scfg)?.volume_size_info(&scfg, &volname)
    }

    /// Move a volume to another guest (and optionally another name), returns the new volume ID.
    pub fn volume_rename(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        target_vmid: u32,
        target_volname: Option<&str>,
    ) -> Result<String, Error> {
        check_vmid(target_vmid)?;
        let (storeid, volname) = parse_volume_id(volid)?;
        let scfg = self.storage_check_enabled(cfg, &storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;

        if !plugin.volume_has_feature(&scfg, VolumeFeature::Rename, &volname, None, false)? {
            return Err(unsupported(VolumeFeature::Rename, volid));
        }

        self.activate_storage(cfg, &storeid)?;

        let newname = self.with_storage_lock(&scfg, || {
            plugin.volume_rename(&scfg, &volname, target_vmid, target_volname)
        })?;
        Ok(format!("{}:{}", storeid, newname))
    }

    /// Access path of a volume. Pure computation, the volume does not need to exist.
    pub fn path(
        &self,
        cfg: &SectionConfigData,
        volid: &str,
        snapname: Option<&str>,
    ) -> Result<VolumePath, Error> {
        let (scfg, volname, _info) = self.parse_volname(cfg, volid)?;
        self.plugin_for(&scfg)?.path(&scfg, &volname, snapname)
    }

    /// Disk images per storage, optionally restricted to one storage, one
    /// guest or a list of volume IDs.
    pub fn vdisk_list(
        &self,
        cfg: &SectionConfigData,
        storeid: Option<&str>,
        vmid: Option<u32>,
        vollist: Option<&[String]>,
    ) -> Result<BTreeMap<String, Vec<VolumeInfo>>, Error> {
        let storages = match storeid {
            Some(storeid) => vec![self.storage_check_enabled(cfg, storeid, None)?],
            None => self.enabled_storages(cfg)?,
        };

        let wanted: Option<BTreeSet<String>> = vollist.map(|list| {
            list.iter()
                .filter_map(|volid| parse_volume_id(volid).ok().map(|(storeid, _)| storeid))
                .collect()
        });

        let mut result = BTreeMap::new();
        for scfg in storages {
            if let Some(wanted) = &wanted {
                if !wanted.contains(scfg.id()) {
                    continue;
                }
            }

            let plugin = self.plugin_for(&scfg)?;
            let content = self.content_types(&scfg, plugin)?;
            if !content.contains(&ContentType::Images) && !content.contains(&ContentType::Rootdir) {
                continue;
            }

            self.activate_storage(cfg, scfg.id())?;

            let mut list = plugin.list_images(&scfg, vmid, vollist)?;
            list.sort_by(|a, b| a.volid.cmp(&b.volid));
            result.insert(scfg.id().to_string(), list);
        }

        Ok(result)
    }

    /// Volumes of one storage, optionally only of one content type and guest.
    pub fn volume_list(
        &self,
        cfg: &SectionConfigData,
        storeid: &str,
        vmid: Option<u32>,
        content: Option<ContentType>,
    ) -> Result<Vec<VolumeInfo>, Error> {
        let scfg = self.storage_check_enabled(cfg, storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;

        let mut content_types = self.content_types(&scfg, plugin)?;
        if let Some(content) = content {
            if !content_types.contains(&content) {
                return Ok(Vec::new());
            }
            content_types = [content].into_iter().collect();
        }

        self.activate_storage(cfg, storeid)?;

        let mut list = plugin.list_volumes(&scfg, vmid, &content_types)?;
        list.sort_by(|a, b| a.volid.cmp(&b.volid));
        Ok(list)
    }
}
