//! LVM volume groups, one logical volume per disk image.

use std::process::Command;

use anyhow::{bail, format_err, Error};

use pve_storage_api_types::volume::parse_lvm_volname;
use pve_storage_api_types::{
    ContentType, LvmStorageConfig, StorageConfig, StorageError, StorageType, VolumeFeature,
    VolumeFormat, VolumeInfo, VolumeName,
};
use pve_storage_buildcfg::BACKEND_QUERY_TIMEOUT;
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{run_command, run_command_timeout, task_log, task_warn};

use super::{
    check_new_image_name, get_next_vm_diskname, image_size_bytes, FeatureKey, PluginData,
    PluginStatus, StoragePlugin, VolumePath, VolumeSize,
};
use crate::worker::WorkerJob;

const LVM_PLUGIN_DATA: PluginData = PluginData {
    content: &[ContentType::Images, ContentType::Rootdir],
    default_content: &[ContentType::Images],
    formats: &[VolumeFormat::Raw],
    fixed_options: &["vgname", "base"],
};

/// Prefix of volumes waiting to be zeroed and removed.
const DELETE_PREFIX: &str = "del-";

/// A logical volume, as reported by `lvs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LvInfo {
    pub vg: String,
    pub name: String,
    pub size: u64,
    pub attr: String,
}

/// A volume group, as reported by `vgs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VgInfo {
    pub name: String,
    pub size: u64,
    pub free: u64,
}

fn parse_size(text: &str) -> Result<u64, Error> {
    let text = text.trim().trim_end_matches('B');
    text.parse()
        .map_err(|_| format_err!("unable to parse size '{}'", text))
}

/// Parse `lvs --separator : -o vg_name,lv_name,lv_size,lv_attr` output.
pub fn parse_lvs_output(output: &str) -> Result<Vec<LvInfo>, Error> {
    let mut list = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 4 {
            bail!("unable to parse lvs output line '{}'", line);
        }
        list.push(LvInfo {
            vg: fields[0].to_string(),
            name: fields[1].to_string(),
            size: parse_size(fields[2])?,
            attr: fields[3].to_string(),
        });
    }
    Ok(list)
}

/// Parse `vgs --separator : -o vg_name,vg_size,vg_free` output.
pub fn parse_vgs_output(output: &str) -> Result<Vec<VgInfo>, Error> {
    let mut list = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 3 {
            bail!("unable to parse vgs output line '{}'", line);
        }
        list.push(VgInfo {
            name: fields[0].to_string(),
            size: parse_size(fields[1])?,
            free: parse_size(fields[2])?,
        });
    }
    Ok(list)
}

fn lvm_config(scfg: &StorageConfig) -> Result<&LvmStorageConfig, Error> {
    match scfg {
        StorageConfig::Lvm(config) => Ok(config),
        other => bail!("storage '{}' is not an LVM storage", other.id()),
    }
}

fn lvm_list_volumes(vgname: &str) -> Result<Vec<LvInfo>, Error> {
    let mut command = Command::new("/sbin/lvs");
    command
        .args(["--noheadings", "--units", "b", "--nosuffix", "--unbuffered"])
        .args(["--separator", ":", "-o", "vg_name,lv_name,lv_size,lv_attr"])
        .arg(vgname);

    let output = run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None)?;
    parse_lvs_output(&output)
}

fn lvm_vgs(vgname: &str) -> Result<Option<VgInfo>, Error> {
    let mut command = Command::new("/sbin/vgs");
    command
        .args(["--noheadings", "--units", "b", "--nosuffix", "--unbuffered"])
        .args(["--separator", ":", "-o", "vg_name,vg_size,vg_free"]);

    let output = run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None)?;
    Ok(parse_vgs_output(&output)?
        .into_iter()
        .find(|vg| vg.name == vgname))
}

fn lvm_feature(feature: VolumeFeature, key: FeatureKey) -> bool {
    match feature {
        VolumeFeature::Copy => matches!(key, FeatureKey::Base | FeatureKey::Current),
        VolumeFeature::Rename => key == FeatureKey::Current,
        _ => false,
    }
}

fn lvremove(vgname: &str, lvname: &str) -> Result<(), Error> {
    let mut command = Command::new("/sbin/lvremove");
    command.arg("-f").arg(format!("{}/{}", vgname, lvname));
    run_command(command, None)?;
    Ok(())
}

fn lvrename(vgname: &str, oldname: &str, newname: &str) -> Result<(), Error> {
    let mut command = Command::new("/sbin/lvrename");
    command.arg(vgname).arg(oldname).arg(newname);
    run_command(command, None)?;
    Ok(())
}

/// Zero out and remove volumes renamed for deletion.
fn zero_and_remove(vgname: &str, lvnames: &[String], task: &dyn WorkerTaskContext) -> Result<(), Error> {
    for lvname in lvnames {
        task.check_abort()?;
        let device = format!("/dev/{}/{}", vgname, lvname);

        task_log!(task, "zero-out data on image {} ({})", lvname, device);
        let mut command = Command::new("/sbin/blkdiscard");
        command.arg("--zeroout").arg(&device);
        if let Err(err) = run_command(command, None) {
            task_warn!(task, "zeroing {} failed - {}", device, err);
        }

        task_log!(task, "successfully removed volume {}", lvname);
        lvremove(vgname, lvname)?;
    }
    Ok(())
}

/// [`StoragePlugin`] for LVM volume groups.
pub struct LvmPlugin;

impl StoragePlugin for LvmPlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::Lvm
    }

    fn plugin_data(&self) -> &'static PluginData {
        &LVM_PLUGIN_DATA
    }

    fn parse_volname(&self, volname: &str) -> Result<VolumeName, Error> {
        Ok(parse_lvm_volname(volname)?)
    }

    fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snapname: Option<&str>,
    ) -> Result<VolumePath, Error> {
        if snapname.is_some() {
            bail!("lvm snapshot is not implemented");
        }
        let config = lvm_config(scfg)?;
        let info = self.parse_volname(volname)?;

        Ok(VolumePath {
            path: format!("/dev/{}/{}", config.vgname, info.name),
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
        let config = lvm_config(scfg)?;
        let mut list = Vec::new();

        for lv in lvm_list_volumes(&config.vgname)? {
            let info = match parse_lvm_volname(&lv.name) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if vmid.is_some() && info.vmid != vmid {
                continue;
            }

            let volid = format!("{}:{}", config.storage, lv.name);
            if let Some(vollist) = vollist {
                if !vollist.contains(&volid) {
                    continue;
                }
            }

            let mut volume = VolumeInfo::new(volid, ContentType::Images, lv.size);
            volume.format = Some(VolumeFormat::Raw);
            volume.vmid = info.vmid;
            list.push(volume);
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
        if format != VolumeFormat::Raw {
            bail!("unsupported format '{}'", format);
        }
        let config = lvm_config(scfg)?;

        let vg = lvm_vgs(&config.vgname)?.ok_or_else(|| StorageError::BackendUnavailable {
            storeid: config.storage.clone(),
            reason: format!("no such volume group '{}'", config.vgname),
        })?;

        let bytes = image_size_bytes(size)?;
        if vg.free < bytes {
            bail!(
                "not enough free space in volume group '{}' ({} < {})",
                config.vgname,
                vg.free,
                bytes
            );
        }

        let existing: Vec<String> = lvm_list_volumes(&config.vgname)?
            .into_iter()
            .map(|lv| lv.name)
            .collect();

        let name = match name {
            Some(name) => {
                check_new_image_name(name, vmid)?;
                if existing.iter().any(|lv| lv == name) {
                    bail!("volume '{}' already exists", name);
                }
                name.to_string()
            }
            None => get_next_vm_diskname(&existing, &config.storage, vmid, None, false)?,
        };

        let mut command = Command::new("/sbin/lvcreate");
        command
            .args(["-aly", "-Wy", "--yes"])
            .args(["--size", &format!("{}k", size)])
            .args(["--name", &name])
            .arg(&config.vgname);
        run_command(command, None)
            .map_err(|err| format_err!("lvcreate '{}/{}' error: {}", config.vgname, name, err))?;

        Ok(name)
    }

    fn free_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        _is_base: bool,
        _format: Option<VolumeFormat>,
    ) -> Result<Option<WorkerJob>, Error> {
        let config = lvm_config(scfg)?;
        let info = self.parse_volname(volname)?;

        if !config.saferemove.unwrap_or(false) {
            lvremove(&config.vgname, &info.name)?;
            return Ok(None);
        }

        // the data is zeroed in the background, the name is free immediately
        let delname = format!("{}{}", DELETE_PREFIX, info.name);
        lvrename(&config.vgname, &info.name, &delname)?;

        let vgname = config.vgname.clone();
        let job = WorkerJob::new(
            "imgdel",
            Some(format!("{}:{}", config.storage, volname)),
            move |task| zero_and_remove(&vgname, &[delname], task),
        );

        Ok(Some(job))
    }

    fn create_base(&self, _scfg: &StorageConfig, _volname: &str) -> Result<String, Error> {
        bail!("can't create base images in lvm storage");
    }

    fn clone_image(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _vmid: u32,
        _snapname: Option<&str>,
    ) -> Result<String, Error> {
        bail!("can't clone images in lvm storage");
    }

    fn volume_size_info(&self, scfg: &StorageConfig, volname: &str) -> Result<VolumeSize, Error> {
        let config = lvm_config(scfg)?;
        let info = self.parse_volname(volname)?;

        let lv = lvm_list_volumes(&config.vgname)?
            .into_iter()
            .find(|lv| lv.name == info.name)
            .ok_or_else(|| format_err!("no such logical volume '{}/{}'", config.vgname, info.name))?;

        Ok(VolumeSize {
            size: lv.size,
            format: Some(VolumeFormat::Raw),
            used: lv.size,
            parent: None,
        })
    }

    fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
        _running: bool,
    ) -> Result<(), Error> {
        let config = lvm_config(scfg)?;
        let info = self.parse_volname(volname)?;

        let mut command = Command::new("/sbin/lvextend");
        command
            .args(["-L", &format!("{}k", size.div_ceil(1024))])
            .arg(format!("{}/{}", config.vgname, info.name));
        run_command(command, None)
            .map_err(|err| format_err!("lvextend '{}/{}' error: {}", config.vgname, info.name, err))?;
        Ok(())
    }

    fn volume_snapshot(&self, _scfg: &StorageConfig, _volname: &str, _snap: &str) -> Result<(), Error> {
        bail!("lvm snapshot is not implemented");
    }

    fn volume_snapshot_rollback(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _snap: &str,
    ) -> Result<(), Error> {
        bail!("lvm snapshot rollback is not implemented");
    }

    fn volume_snapshot_delete(
        &self,
        _scfg: &StorageConfig,
        _volname: &str,
        _snap: &str,
        _running: bool,
    ) -> Result<(), Error> {
        bail!("lvm snapshot delete is not implemented");
    }

    fn volume_snapshot_list(&self, _scfg: &StorageConfig, _volname: &str) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
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
        Ok(lvm_feature(feature, FeatureKey::new(info.is_base, snapname)))
    }

    fn volume_rename(
        &self,
        scfg: &StorageConfig,
        source_volname: &str,
        target_vmid: u32,
        target_volname: Option<&str>,
    ) -> Result<String, Error> {
        let config = lvm_config(scfg)?;
        let info = self.parse_volname(source_volname)?;

        let existing: Vec<String> = lvm_list_volumes(&config.vgname)?
            .into_iter()
            .map(|lv| lv.name)
            .collect();

        let target = match target_volname {
            Some(name) => {
                check_new_image_name(name, target_vmid)?;
                name.to_string()
            }
            None => get_next_vm_diskname(&existing, &config.storage, target_vmid, None, false)?,
        };
        if existing.contains(&target) {
            bail!("target volume '{}' already exists", target);
        }

        lvrename(&config.vgname, &info.name, &target)?;
        Ok(target)
    }

    fn activate_storage(
        &self,
        scfg: &StorageConfig,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let config = lvm_config(scfg)?;

        if lvm_vgs(&config.vgname)?.is_none() {
            return Err(StorageError::BackendUnavailable {
                storeid: config.storage.clone(),
                reason: format!("volume group '{}' not found", config.vgname),
            }
            .into());
        }

        // finish removals interrupted by a reboot
        let pending: Vec<String> = lvm_list_volumes(&config.vgname)?
            .into_iter()
            .filter(|lv| lv.name.starts_with(DELETE_PREFIX))
            .map(|lv| lv.name)
            .collect();
        if !pending.is_empty() {
            task_log!(task, "found {} volumes pending removal", pending.len());
            zero_and_remove(&config.vgname, &pending, task)?;
        }

        let mut command = Command::new("/sbin/vgchange");
        command.arg("-aly").arg(&config.vgname);
        run_command(command, None)?;
        Ok(())
    }

    fn deactivate_storage(&self, scfg: &StorageConfig) -> Result<(), Error> {
        let config = lvm_config(scfg)?;
        let mut command = Command::new("/sbin/vgchange");
        command.arg("-aln").arg(&config.vgname);
        run_command(command, None)?;
        Ok(())
    }

    fn activate_volume(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        _snapname: Option<&str>,
    ) -> Result<(), Error> {
        let path = self.path(scfg, volname, None)?;
        let mut command = Command::new("/sbin/lvchange");
        command.arg("-aly").arg(&path.path);
        run_command(command, None)
            .map_err(|err| format_err!("lvchange -aly '{}' error: {}", path.path, err))?;
        Ok(())
    }

    fn deactivate_volume(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        _snapname: Option<&str>,
    ) -> Result<(), Error> {
        let path = self.path(scfg, volname, None)?;
        if !std::path::Path::new(&path.path).exists() {
            return Ok(());
        }
        let mut command = Command::new("/sbin/lvchange");
        command.arg("-aln").arg(&path.path);
        run_command(command, None)
            .map_err(|err| format_err!("lvchange -aln '{}' error: {}", path.path, err))?;
        Ok(())
    }

    fn status(&self, scfg: &StorageConfig) -> Result<PluginStatus, Error> {
        let config = lvm_config(scfg)?;

        match lvm_vgs(&config.vgname)? {
            Some(vg) => Ok(PluginStatus {
                total: vg.size,
                avail: vg.free,
                used: vg.size.saturating_sub(vg.free),
                active: true,
            }),
            None => Ok(PluginStatus::default()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_lvs_output() -> Result<(), Error> {
        let output = "  pve:vm-100-disk-0:4294967296:-wi-a-----\n  pve:data:34359738368:twi-aotz--\n\n";
        let list = parse_lvs_output(output)?;
        assert_eq!(list.len(), 2);
        assert_eq!(
            list[0],
            LvInfo {
                vg: "pve".to_string(),
                name: "vm-100-disk-0".to_string(),
                size: 4294967296,
                attr: "-wi-a-----".to_string(),
            }
        );
        assert!(parse_lvs_output("pve:broken").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_vgs_output() -> Result<(), Error> {
        let list = parse_vgs_output("  pve:68182605824B:16106127360B\n  other:1000:0\n")?;
        assert_eq!(
            list[0],
            VgInfo {
                name: "pve".to_string(),
                size: 68182605824,
                free: 16106127360,
            }
        );
        assert_eq!(list[1].free, 0);
        Ok(())
    }

    #[test]
    fn test_lvm_features() {
        assert!(lvm_feature(VolumeFeature::Copy, FeatureKey::Current));
        assert!(lvm_feature(VolumeFeature::Copy, FeatureKey::Base));
        assert!(!lvm_feature(VolumeFeature::Copy, FeatureKey::Snap));
        assert!(!lvm_feature(VolumeFeature::Snapshot, FeatureKey::Current));
        assert!(!lvm_feature(VolumeFeature::Clone, FeatureKey::Base));
    }
}
