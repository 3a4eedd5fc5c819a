//! ZFS pools: zvols for VM disks, file systems for container subvolumes.

use std::process::Command;

use anyhow::{bail, format_err, Error};

use pve_storage_api_types::volume::parse_pool_volname;
use pve_storage_api_types::{
    ContentType, StorageConfig, StorageError, StorageType, VolumeFeature, VolumeFormat,
    VolumeInfo, VolumeName, ZfsPoolStorageConfig,
};
use pve_storage_buildcfg::BACKEND_QUERY_TIMEOUT;
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{run_command, run_command_timeout, task_log};

use super::{
    check_new_image_name, get_next_vm_diskname, FeatureKey, PluginData, PluginStatus,
    StoragePlugin, VolumePath, VolumeSize,
};
use crate::worker::WorkerJob;

const ZFS: &str = "/sbin/zfs";

/// Snapshot linked clones are created from.
pub const BASE_SNAPSHOT: &str = "__base__";

const ZFS_PLUGIN_DATA: PluginData = PluginData {
    content: &[ContentType::Images, ContentType::Rootdir],
    default_content: &[ContentType::Images, ContentType::Rootdir],
    formats: &[VolumeFormat::Raw, VolumeFormat::Subvol],
    fixed_options: &["pool", "sparse"],
};

/// A dataset directly below the pool, as reported by `zfs list`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZfsDataset {
    /// Dataset name without the pool prefix.
    pub name: String,
    /// Volume size (zvols) or quota (file systems) in bytes, `0` means unlimited.
    pub size: u64,
    /// Origin dataset name (without pool prefix) for clones.
    pub origin: Option<String>,
    pub format: VolumeFormat,
}

fn parse_zfs_number(text: &str) -> Result<u64, Error> {
    match text {
        "-" | "none" => Ok(0),
        text => text
            .parse()
            .map_err(|_| format_err!("unable to parse zfs value '{}'", text)),
    }
}

/// Parse `zfs list -o name,volsize,origin,type,refquota -Hp` output.
pub fn parse_zfs_list_output(pool: &str, output: &str) -> Result<Vec<ZfsDataset>, Error> {
    let prefix = format!("{}/", pool);
    let mut list = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            bail!("unable to parse zfs list output line '{}'", line);
        }

        let name = match fields[0].strip_prefix(&prefix) {
            Some(name) if !name.contains('/') => name.to_string(),
            _ => continue,
        };

        let (format, size) = match fields[3] {
            "volume" => (VolumeFormat::Raw, parse_zfs_number(fields[1])?),
            "filesystem" => (VolumeFormat::Subvol, parse_zfs_number(fields[4])?),
            _ => continue,
        };

        let origin = match fields[2] {
            "-" => None,
            origin => origin
                .strip_prefix(&prefix)
                .and_then(|o| o.split('@').next())
                .map(String::from),
        };

        list.push(ZfsDataset {
            name,
            size,
            origin,
            format,
        });
    }

    Ok(list)
}

/// Parse the values of `zfs get -o value -Hp prop1,prop2,...`.
pub fn parse_zfs_values(output: &str, expected: usize) -> Result<Vec<u64>, Error> {
    let values: Vec<u64> = output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_zfs_number(line.trim()))
        .collect::<Result<_, Error>>()?;

    if values.len() != expected {
        bail!("got {} values from zfs get, expected {}", values.len(), expected);
    }
    Ok(values)
}

/// Snapshots newer than `snap` in a creation ordered list.
pub fn newer_snapshots(snapshots: &[String], snap: &str) -> Result<Vec<String>, Error> {
    match snapshots.iter().position(|s| s == snap) {
        Some(pos) => Ok(snapshots[pos + 1..].to_vec()),
        None => bail!("snapshot '{}' does not exist", snap),
    }
}

fn zfs_feature(feature: VolumeFeature, key: FeatureKey) -> bool {
    use FeatureKey::*;

    match feature {
        VolumeFeature::Snapshot => matches!(key, Current | Snap),
        VolumeFeature::Clone => key == Base,
        VolumeFeature::Template => key == Current,
        VolumeFeature::Copy => matches!(key, Base | Current),
        VolumeFeature::Sparseinit => matches!(key, Base | Current),
        // replication snapshots the volume
        VolumeFeature::Replicate => key == Current,
        VolumeFeature::Rename => key == Current,
    }
}

fn zfs_config(scfg: &StorageConfig) -> Result<&ZfsPoolStorageConfig, Error> {
    match scfg {
        StorageConfig::ZfsPool(config) => Ok(config),
        other => bail!("storage '{}' is not a ZFS pool storage", other.id()),
    }
}

/// Full dataset name (`<pool>/<name>`) of a volume.
pub fn volume_dataset(scfg: &StorageConfig, volname: &str) -> Result<String, Error> {
    let config = zfs_config(scfg)?;
    let info = parse_pool_volname(volname)?;
    Ok(format!("{}/{}", config.pool, info.name))
}

fn zfs_request(args: &[&str]) -> Result<String, Error> {
    let mut command = Command::new(ZFS);
    command.args(args);
    run_command(command, None)
}

fn zfs_query(args: &[&str]) -> Result<String, Error> {
    let mut command = Command::new(ZFS);
    command.args(args);
    run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None)
}

fn list_datasets(pool: &str) -> Result<Vec<ZfsDataset>, Error> {
    let output = zfs_query(&[
        "list",
        "-o",
        "name,volsize,origin,type,refquota",
        "-t",
        "volume,filesystem",
        "-d1",
        "-Hp",
        pool,
    ])?;
    parse_zfs_list_output(pool, &output)
}

/// Snapshots of a dataset, oldest first.
fn list_snapshots(pool: &str, name: &str) -> Result<Vec<String>, Error> {
    let dataset = format!("{}/{}", pool, name);
    let output = zfs_query(&[
        "list", "-t", "snapshot", "-o", "name", "-s", "creation", "-H", "-r", &dataset,
    ])?;

    let prefix = format!("{}@", dataset);
    Ok(output
        .lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .map(String::from)
        .collect())
}

fn mountpoint(config: &ZfsPoolStorageConfig) -> String {
    config
        .mountpoint
        .clone()
        .unwrap_or_else(|| format!("/{}", config.pool))
}

/// Size in KiB for zfs properties, rounded up to full MiB.
fn zfs_size_kib(bytes: u64) -> u64 {
    bytes.div_ceil(1024 * 1024) * 1024
}

/// [`StoragePlugin`] for ZFS pools.
pub struct ZfsPoolPlugin;

impl ZfsPoolPlugin {
    fn create_dataset(
        &self,
        config: &ZfsPoolStorageConfig,
        name: &str,
        format: VolumeFormat,
        size: u64,
    ) -> Result<(), Error> {
        let dataset = format!("{}/{}", config.pool, name);
        let mut args: Vec<String> = vec!["create".into()];

        if format == VolumeFormat::Subvol {
            let quota = if size == 0 {
                "none".to_string()
            } else {
                format!("{}k", size)
            };
            args.extend(["-o".into(), "acltype=posixacl".into()]);
            args.extend(["-o".into(), "xattr=sa".into()]);
            args.extend(["-o".into(), format!("refquota={}", quota)]);
        } else {
            if config.sparse.unwrap_or(false) {
                args.push("-s".into());
            }
            if let Some(blocksize) = &config.blocksize {
                args.extend(["-b".into(), blocksize.clone()]);
            }
            args.extend(["-V".into(), format!("{}k", size)]);
        }
        args.push(dataset);

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        zfs_request(&args)?;
        Ok(())
    }
}

impl StoragePlugin for ZfsPoolPlugin {
    fn storage_type(&self) -> StorageType {
        StorageType::ZfsPool
    }

    fn plugin_data(&self) -> &'static PluginData {
        &ZFS_PLUGIN_DATA
    }

    fn parse_volname(&self, volname: &str) -> Result<VolumeName, Error> {
        Ok(parse_pool_volname(volname)?)
    }

    fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snapname: Option<&str>,
    ) -> Result<VolumePath, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;

        let path = match (info.format, snapname) {
            (Some(VolumeFormat::Subvol), None) => format!("{}/{}", mountpoint(config), info.name),
            (Some(VolumeFormat::Subvol), Some(snap)) => format!(
                "{}/{}/.zfs/snapshot/{}",
                mountpoint(config),
                info.name,
                snap
            ),
            (_, None) => format!("/dev/zvol/{}/{}", config.pool, info.name),
            (_, Some(snap)) => format!("/dev/zvol/{}/{}@{}", config.pool, info.name, snap),
        };

        Ok(VolumePath {
            path,
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
        let config = zfs_config(scfg)?;
        let mut list = Vec::new();

        for dataset in list_datasets(&config.pool)? {
            let volname = match &dataset.origin {
                Some(origin) => format!("{}/{}", origin, dataset.name),
                None => dataset.name.clone(),
            };
            let info = match parse_pool_volname(&volname) {
                Ok(info) => info,
                Err(_) => continue,
            };
            if vmid.is_some() && info.vmid != vmid {
                continue;
            }

            let volid = format!("{}:{}", config.storage, volname);
            if let Some(vollist) = vollist {
                if !vollist.contains(&volid) {
                    continue;
                }
            }

            let content = if dataset.format == VolumeFormat::Subvol {
                ContentType::Rootdir
            } else {
                ContentType::Images
            };
            let mut volume = VolumeInfo::new(volid, content, dataset.size);
            volume.format = Some(dataset.format);
            volume.vmid = info.vmid;
            volume.parent = dataset.origin.clone();
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
        let config = zfs_config(scfg)?;

        let prefix = match format {
            VolumeFormat::Raw => "vm",
            VolumeFormat::Subvol => "subvol",
            other => bail!("unsupported format '{}'", other),
        };

        let name = match name {
            Some(name) => {
                check_new_image_name(name, vmid)?;
                if !name.starts_with(&format!("{}-", prefix)) {
                    bail!("illegal name '{}' - should be '{}-{}-*'", name, prefix, vmid);
                }
                name.to_string()
            }
            None => {
                let existing: Vec<String> = list_datasets(&config.pool)?
                    .into_iter()
                    .map(|dataset| dataset.name)
                    .collect();
                get_next_vm_diskname(&existing, &config.storage, vmid, Some(format), false)?
            }
        };

        self.create_dataset(config, &name, format, size)?;
        Ok(name)
    }

    fn free_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        _is_base: bool,
        _format: Option<VolumeFormat>,
    ) -> Result<Option<WorkerJob>, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;

        zfs_request(&["destroy", "-r", &format!("{}/{}", config.pool, info.name)])?;
        Ok(None)
    }

    fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;

        if info.is_base {
            bail!("create_base not possible with base image");
        }

        let newname = if let Some(rest) = info.name.strip_prefix("subvol-") {
            format!("basevol-{}", rest)
        } else if let Some(rest) = info.name.strip_prefix("vm-") {
            format!("base-{}", rest)
        } else {
            bail!("unexpected volume name '{}'", info.name);
        };

        zfs_request(&[
            "rename",
            &format!("{}/{}", config.pool, info.name),
            &format!("{}/{}", config.pool, newname),
        ])?;
        zfs_request(&["snapshot", &format!("{}/{}@{}", config.pool, newname, BASE_SNAPSHOT)])?;

        Ok(match &info.basename {
            Some(basename) => format!("{}/{}", basename, newname),
            None => newname,
        })
    }

    fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snapname: Option<&str>,
    ) -> Result<String, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;

        if !info.is_base {
            return Err(StorageError::InvariantViolation(format!(
                "clone_image only works on base images, '{}' is not a base image",
                volname
            ))
            .into());
        }

        let format = info.format.unwrap_or(VolumeFormat::Raw);
        let existing: Vec<String> = list_datasets(&config.pool)?
            .into_iter()
            .map(|dataset| dataset.name)
            .collect();
        let name = get_next_vm_diskname(&existing, &config.storage, vmid, Some(format), false)?;

        let snap = snapname.unwrap_or(BASE_SNAPSHOT);
        let source = format!("{}/{}@{}", config.pool, info.name, snap);
        let target = format!("{}/{}", config.pool, name);

        if format == VolumeFormat::Subvol {
            let base = format!("{}/{}", config.pool, info.name);
            let quota = zfs_query(&["get", "-o", "value", "-Hp", "refquota", &base])?;
            let quota = quota.trim();
            zfs_request(&["clone", "-o", &format!("refquota={}", quota), &source, &target])?;
        } else {
            zfs_request(&["clone", &source, &target])?;
        }

        Ok(format!("{}/{}", info.name, name))
    }

    fn volume_size_info(&self, scfg: &StorageConfig, volname: &str) -> Result<VolumeSize, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        let dataset = format!("{}/{}", config.pool, info.name);

        let format = info.format.unwrap_or(VolumeFormat::Raw);
        let size_prop = if format == VolumeFormat::Subvol { "refquota" } else { "volsize" };

        let output = zfs_query(&["get", "-o", "value", "-Hp", &format!("{},used", size_prop), &dataset])?;
        let values = parse_zfs_values(&output, 2)?;

        Ok(VolumeSize {
            size: values[0],
            format: Some(format),
            used: values[1],
            parent: info.basename.clone(),
        })
    }

    fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
        _running: bool,
    ) -> Result<(), Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;

        let property = if info.format == Some(VolumeFormat::Subvol) {
            "refquota"
        } else {
            "volsize"
        };

        zfs_request(&[
            "set",
            &format!("{}={}k", property, zfs_size_kib(size)),
            &format!("{}/{}", config.pool, info.name),
        ])?;
        Ok(())
    }

    fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        zfs_request(&["snapshot", &format!("{}/{}@{}", config.pool, info.name, snap)])?;
        Ok(())
    }

    fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<(), Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        zfs_request(&["rollback", &format!("{}/{}@{}", config.pool, info.name, snap)])?;
        Ok(())
    }

    fn volume_rollback_blockers(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<Vec<String>, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        let snapshots = list_snapshots(&config.pool, &info.name)?;
        newer_snapshots(&snapshots, snap)
    }

    fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
        _running: bool,
    ) -> Result<(), Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        zfs_request(&["destroy", &format!("{}/{}@{}", config.pool, info.name, snap)])?;
        Ok(())
    }

    fn volume_snapshot_list(&self, scfg: &StorageConfig, volname: &str) -> Result<Vec<String>, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(volname)?;
        list_snapshots(&config.pool, &info.name)
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
        Ok(zfs_feature(feature, FeatureKey::new(info.is_base, snapname)))
    }

    fn volume_rename(
        &self,
        scfg: &StorageConfig,
        source_volname: &str,
        target_vmid: u32,
        target_volname: Option<&str>,
    ) -> Result<String, Error> {
        let config = zfs_config(scfg)?;
        let info = self.parse_volname(source_volname)?;
        let format = info.format.unwrap_or(VolumeFormat::Raw);

        let existing: Vec<String> = list_datasets(&config.pool)?
            .into_iter()
            .map(|dataset| dataset.name)
            .collect();

        let target = match target_volname {
            Some(name) => {
                check_new_image_name(name, target_vmid)?;
                name.to_string()
            }
            None => get_next_vm_diskname(&existing, &config.storage, target_vmid, Some(format), false)?,
        };
        if existing.contains(&target) {
            bail!("target volume '{}' already exists", target);
        }

        zfs_request(&[
            "rename",
            &format!("{}/{}", config.pool, info.name),
            &format!("{}/{}", config.pool, target),
        ])?;

        Ok(match &info.basename {
            Some(basename) => format!("{}/{}", basename, target),
            None => target,
        })
    }

    fn activate_storage(
        &self,
        scfg: &StorageConfig,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let config = zfs_config(scfg)?;

        if zfs_query(&["list", "-H", "-o", "name", &config.pool]).is_ok() {
            return Ok(());
        }

        // the pool may just not be imported yet
        let pool = config.pool.split('/').next().unwrap_or(&config.pool);
        task_log!(task, "importing zfs pool '{}'", pool);
        let mut command = Command::new("/sbin/zpool");
        command.args(["import", "-d", "/dev/disk/by-id/", "-o", "cachefile=none", pool]);
        run_command(command, None).map_err(|err| StorageError::BackendUnavailable {
            storeid: config.storage.clone(),
            reason: format!("unable to import pool '{}' - {}", pool, err),
        })?;

        Ok(())
    }

    fn status(&self, scfg: &StorageConfig) -> Result<PluginStatus, Error> {
        let config = zfs_config(scfg)?;

        let output = zfs_query(&["get", "-o", "value", "-Hp", "available,used", &config.pool])?;
        let values = parse_zfs_values(&output, 2)?;

        Ok(PluginStatus {
            total: values[0] + values[1],
            avail: values[0],
            used: values[1],
            active: true,
        })
    }
}
