//! Shared implementation of all storages which keep volumes as files below a
//! directory (local directories, NFS and CIFS shares).
//!
//! Layout below the storage path:
//!
//! ```text
//! images/<vmid>/<name>.<fmt>   disk images (linked clones reference ../<basevmid>/<basename>)
//! private/<vmid>               container directories
//! template/iso                 ISO images
//! template/cache               container templates
//! dump                         backup archives
//! snippets                     snippets
//! import                       import sources
//! ```
//!
//! The type specific part (mounting, connection checks, credentials) is
//! provided by a [`FileBackend`].

use std::collections::BTreeSet;
use std::fs::{OpenOptions, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, format_err, Error};
use serde::Deserialize;

use pve_storage_api_types::volume::{archive_info, parse_dir_volname, parse_image_file_name};
use pve_storage_api_types::{
    parse_vmid, ContentType, StorageConfig, StorageError, StorageType,
    VolumeFeature, VolumeFormat, VolumeInfo, VolumeName,
};
use pve_storage_buildcfg::BACKEND_QUERY_TIMEOUT;
use pve_storage_config::ClusterFilesystem;
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{run_command, run_command_timeout};

use super::{
    check_new_image_name, get_next_vm_diskname, image_size_bytes, FeatureKey, PluginData,
    PluginStatus, StoragePlugin, VolumePath, VolumeSize,
};
use crate::worker::WorkerJob;

const QEMU_IMG: &str = "/usr/bin/qemu-img";
const CHATTR: &str = "/usr/bin/chattr";

/// Type specific part of a file based storage.
pub trait FileBackend: Send + Sync + 'static {
    fn storage_type(&self) -> StorageType;

    fn plugin_data(&self) -> &'static PluginData;

    /// Make `path` available (mount the share, create the directory).
    fn activate(
        &self,
        scfg: &StorageConfig,
        path: &Path,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error>;

    fn deactivate(&self, _scfg: &StorageConfig, _path: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn check_connection(&self, _scfg: &StorageConfig) -> Result<bool, Error> {
        Ok(true)
    }

    fn on_add_hook(
        &self,
        _scfg: &StorageConfig,
        _password: Option<&str>,
        _cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn on_delete_hook(
        &self,
        _scfg: &StorageConfig,
        _cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Subdirectory of a content type, relative to the storage path.
pub fn content_subdir(vtype: ContentType) -> &'static str {
    match vtype {
        ContentType::Images => "images",
        ContentType::Rootdir => "private",
        ContentType::Iso => "template/iso",
        ContentType::Vztmpl => "template/cache",
        ContentType::Backup => "dump",
        ContentType::Snippets => "snippets",
        ContentType::Import => "import",
    }
}

/// File system path of a parsed volume name.
pub fn filesystem_path(base: &Path, info: &VolumeName) -> PathBuf {
    let subdir = base.join(content_subdir(info.vtype));
    match info.vtype {
        ContentType::Images => subdir
            .join(info.vmid.unwrap_or_default().to_string())
            .join(&info.name),
        ContentType::Rootdir => subdir.join(info.vmid.unwrap_or_default().to_string()),
        _ => subdir.join(&info.name),
    }
}

fn base_path(scfg: &StorageConfig) -> Result<&Path, Error> {
    match scfg.path() {
        Some(path) => Ok(Path::new(path)),
        None => bail!("storage definition of '{}' has no path", scfg.id()),
    }
}

fn mkdir_allowed(scfg: &StorageConfig) -> bool {
    match scfg {
        StorageConfig::Dir(config) => config.mkdir.unwrap_or(true),
        _ => true,
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct QemuImgSnapshot {
    name: String,
    #[serde(default)]
    date_sec: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct QemuImgInfo {
    virtual_size: u64,
    #[serde(default)]
    actual_size: u64,
    format: String,
    backing_filename: Option<String>,
    #[serde(default)]
    snapshots: Vec<QemuImgSnapshot>,
}

fn qemu_img_info(path: &Path, format: Option<VolumeFormat>) -> Result<QemuImgInfo, Error> {
    let mut command = Command::new(QEMU_IMG);
    command.args(["info", "--output=json"]);
    if let Some(format) = format {
        command.args(["-f", &format.to_string()]);
    }
    command.arg(path);

    let output = run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None)?;
    serde_json::from_str(&output)
        .map_err(|err| format_err!("unable to parse 'qemu-img info' output for {:?} - {}", path, err))
}

/// Size information of an image file.
pub fn file_size_info(path: &Path, format: Option<VolumeFormat>) -> Result<VolumeSize, Error> {
    let metadata =
        std::fs::metadata(path).map_err(|err| format_err!("unable to stat {:?} - {}", path, err))?;

    if metadata.is_dir() {
        return Ok(VolumeSize {
            size: 0,
            format: Some(VolumeFormat::Subvol),
            used: 0,
            parent: None,
        });
    }

    match format {
        Some(VolumeFormat::Qcow2) | Some(VolumeFormat::Vmdk) => {
            let info = qemu_img_info(path, format)?;
            Ok(VolumeSize {
                size: info.virtual_size,
                format: info.format.parse().ok(),
                used: info.actual_size,
                parent: info.backing_filename,
            })
        }
        _ => Ok(VolumeSize {
            size: metadata.len(),
            format: Some(VolumeFormat::Raw),
            used: metadata.blocks() * 512,
            parent: None,
        }),
    }
}

fn file_feature(feature: VolumeFeature, key: FeatureKey, format: VolumeFormat) -> bool {
    use FeatureKey::*;
    use VolumeFormat::*;

    let images = matches!(format, Raw | Qcow2 | Vmdk);

    match feature {
        VolumeFeature::Snapshot => matches!(key, Current | Snap) && format == Qcow2,
        VolumeFeature::Clone => key == Base && images,
        VolumeFeature::Template => key == Current,
        VolumeFeature::Copy => match key {
            Base | Current => images,
            Snap => format == Qcow2,
        },
        VolumeFeature::Sparseinit => matches!(key, Base | Current) && images,
        VolumeFeature::Rename => key == Current && images,
        VolumeFeature::Replicate => false,
    }
}

/// Remove a file, a missing file is not an error.
fn remove_file_if_exists(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => bail!("removing {:?} failed - {}", path, err),
    }
}

/// Remove the remains of an image whose allocation failed.
fn remove_failed_image(path: &Path) {
    if let Err(err) = remove_file_if_exists(path) {
        log::warn!("cleanup after failed allocation - {}", err);
    }
}

/// Remove a directory if it is empty.
fn remove_empty_dir(dir: &Path) {
    match std::fs::remove_dir(dir) {
        Ok(()) => (),
        Err(err) if err.raw_os_error() == Some(nix::libc::ENOTEMPTY) => (),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
        Err(err) => log::warn!("unable to remove directory {:?} - {}", dir, err),
    }
}

fn protected_marker(path: &Path) -> PathBuf {
    let mut marker = path.as_os_str().to_owned();
    marker.push(".protected");
    PathBuf::from(marker)
}

/// Log and notes files belonging to a backup archive.
fn backup_companion_files(path: &Path) -> Vec<PathBuf> {
    let mut list = Vec::new();

    let mut notes = path.as_os_str().to_owned();
    notes.push(".notes");
    list.push(PathBuf::from(notes));

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Ok(info) = archive_info(name) {
            if info.is_std_name() {
                let stem = name.split('.').next().unwrap_or(name);
                list.push(path.with_file_name(format!("{}.log", stem)));
            }
        }
    }

    list
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>, Error> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => bail!("unable to read directory {:?} - {}", dir, err),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| format_err!("reading {:?} failed - {}", dir, err))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn mtime(path: &Path) -> Option<i64> {
    std::fs::metadata(path).ok().map(|m| m.mtime())
}

/// A mount table entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub source: String,
    pub target: String,
    pub fstype: String,
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if octal {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            out.push(value as u8);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse a mount table in `/proc/mounts` format.
pub fn parse_mounts(content: &str) -> Vec<MountEntry> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_ascii_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            let fstype = fields.next()?;
            Some(MountEntry {
                source: unescape_mount_field(source),
                target: unescape_mount_field(target),
                fstype: fstype.to_string(),
            })
        })
        .collect()
}

/// Whether something matching `check` is mounted at `target`.
pub fn is_mounted<F>(target: &Path, check: F) -> Result<bool, Error>
where
    F: Fn(&MountEntry) -> bool,
{
    let content = std::fs::read_to_string("/proc/mounts")
        .map_err(|err| format_err!("unable to read /proc/mounts - {}", err))?;
    let target = target.to_string_lossy();
    let target = target.trim_end_matches('/');

    Ok(parse_mounts(&content)
        .iter()
        .any(|entry| entry.target.trim_end_matches('/') == target && check(entry)))
}

/// [`StoragePlugin`] for everything storing volumes as files.
pub struct FileBasedPlugin<B> {
    backend: B,
}

impl<B: FileBackend> FileBasedPlugin<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn parse(&self, volname: &str) -> Result<VolumeName, Error> {
        Ok(parse_dir_volname(volname)?)
    }

    fn image_path(&self, scfg: &StorageConfig, volname: &str) -> Result<(VolumeName, PathBuf), Error> {
        let info = self.parse(volname)?;
        let path = filesystem_path(base_path(scfg)?, &info);
        Ok((info, path))
    }

    fn qcow2_only(&self, info: &VolumeName, volname: &str) -> Result<(), Error> {
        if info.format != Some(VolumeFormat::Qcow2) {
            bail!("can't snapshot volume '{}' - format is not qcow2", volname);
        }
        Ok(())
    }

    fn image_info(
        &self,
        scfg: &StorageConfig,
        vmid: u32,
        name: &str,
        path: &Path,
    ) -> Result<Option<VolumeInfo>, Error> {
        let (format, _is_base) = match parse_image_file_name(name) {
            Ok(res) => res,
            Err(_) => return Ok(None),
        };

        let size = file_size_info(path, Some(format))?;

        let mut volname = format!("{}/{}", vmid, name);
        let mut parent = None;
        if let Some(backing) = &size.parent {
            // linked clones reference their base as ../<basevmid>/<basename>
            match backing.strip_prefix("../").and_then(|rest| rest.split_once('/')) {
                Some((basevmid, basename)) if parse_vmid(basevmid).is_ok() => {
                    volname = format!("{}/{}/{}/{}", basevmid, basename, vmid, name);
                    parent = Some(format!("../{}/{}", basevmid, basename));
                }
                _ => log::warn!("image {:?} has unexpected backing file '{}'", path, backing),
            }
        }

        let content = if format == VolumeFormat::Subvol {
            ContentType::Rootdir
        } else {
            ContentType::Images
        };

        let mut info = VolumeInfo::new(format!("{}:{}", scfg.id(), volname), content, size.size);
        info.format = Some(format);
        info.vmid = Some(vmid);
        info.parent = parent;
        info.ctime = mtime(path);
        Ok(Some(info))
    }

    fn list_content_files(
        &self,
        scfg: &StorageConfig,
        base: &Path,
        vtype: ContentType,
        vmid: Option<u32>,
    ) -> Result<Vec<VolumeInfo>, Error> {
        let dir = base.join(content_subdir(vtype));
        let mut list = Vec::new();

        for name in list_dir_names(&dir)? {
            let volname = format!("{}/{}", vtype, name);
            let parsed = match parse_dir_volname(&volname) {
                Ok(parsed) if parsed.vtype == vtype => parsed,
                _ => continue,
            };
            if vmid.is_some() && parsed.vmid != vmid {
                continue;
            }

            let path = dir.join(&name);
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) if metadata.is_file() => metadata,
                _ => continue,
            };

            let mut info = VolumeInfo::new(format!("{}:{}", scfg.id(), volname), vtype, metadata.len());
            info.vmid = parsed.vmid;
            info.ctime = Some(metadata.mtime());

            if vtype == ContentType::Backup {
                if let Ok(archive) = archive_info(&name) {
                    if let Some(ctime) = archive.ctime {
                        info.ctime = Some(ctime);
                    }
                }
                info.protected = protected_marker(&path).exists();
            }

            list.push(info);
        }

        Ok(list)
    }
}

impl<B: FileBackend> StoragePlugin for FileBasedPlugin<B> {
    fn storage_type(&self) -> StorageType {
        self.backend.storage_type()
    }

    fn plugin_data(&self) -> &'static PluginData {
        self.backend.plugin_data()
    }

    fn parse_volname(&self, volname: &str) -> Result<VolumeName, Error> {
        self.parse(volname)
    }

    fn path(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snapname: Option<&str>,
    ) -> Result<VolumePath, Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        if snapname.is_some() {
            self.qcow2_only(&info, volname)?;
        }
        Ok(VolumePath {
            path: path.to_string_lossy().into_owned(),
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
        let imagedir = base_path(scfg)?.join(content_subdir(ContentType::Images));
        let mut list = Vec::new();

        for dirname in list_dir_names(&imagedir)? {
            let owner = match parse_vmid(&dirname) {
                Ok(owner) => owner,
                Err(_) => continue,
            };
            if vmid.map(|vmid| vmid != owner).unwrap_or(false) {
                continue;
            }

            let dir = imagedir.join(&dirname);
            for name in list_dir_names(&dir)? {
                let path = dir.join(&name);
                if let Some(info) = self.image_info(scfg, owner, &name, &path)? {
                    if let Some(vollist) = vollist {
                        if !vollist.contains(&info.volid) {
                            continue;
                        }
                    }
                    list.push(info);
                }
            }
        }

        Ok(list)
    }

    fn list_volumes(
        &self,
        scfg: &StorageConfig,
        vmid: Option<u32>,
        content: &BTreeSet<ContentType>,
    ) -> Result<Vec<VolumeInfo>, Error> {
        let base = base_path(scfg)?;
        let mut list = Vec::new();

        if content.contains(&ContentType::Images) || content.contains(&ContentType::Rootdir) {
            let mut images = self.list_images(scfg, vmid, None)?;
            images.retain(|info| content.contains(&info.content));
            list.append(&mut images);
        }

        for vtype in content {
            match vtype {
                ContentType::Images | ContentType::Rootdir => continue,
                vtype => list.append(&mut self.list_content_files(scfg, base, *vtype, vmid)?),
            }
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
        let imagedir = base_path(scfg)?
            .join(content_subdir(ContentType::Images))
            .join(vmid.to_string());

        proxmox_sys::fs::create_path(&imagedir, None, None)
            .map_err(|err| format_err!("unable to create directory {:?} - {}", imagedir, err))?;

        let name = match name {
            Some(name) => {
                check_new_image_name(name, vmid)?;
                name.to_string()
            }
            None => {
                let existing = list_dir_names(&imagedir)?;
                get_next_vm_diskname(&existing, scfg.id(), vmid, Some(format), true)?
            }
        };

        let (name_format, _) = parse_image_file_name(&name)?;
        if name_format != format {
            bail!(
                "illegal name '{}' - wrong extension for format ('{} != {}')",
                name,
                name_format,
                format
            );
        }

        let path = imagedir.join(&name);
        if path.exists() {
            bail!("disk image '{:?}' already exists", path);
        }

        match format {
            VolumeFormat::Subvol => {
                if size != 0 {
                    bail!("storage '{}' does not support subvol quotas", scfg.id());
                }
                std::fs::create_dir(&path)
                    .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
            }
            VolumeFormat::Raw => {
                let bytes = image_size_bytes(size)?;
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|err| format_err!("unable to create {:?} - {}", path, err))?;
                if let Err(err) = file.set_len(bytes) {
                    drop(file);
                    remove_failed_image(&path);
                    bail!("unable to allocate {:?} - {}", path, err);
                }
            }
            VolumeFormat::Qcow2 | VolumeFormat::Vmdk => {
                let mut command = Command::new(QEMU_IMG);
                command.arg("create");
                if format == VolumeFormat::Qcow2 {
                    command.args(["-o", "preallocation=metadata"]);
                }
                command
                    .args(["-f", &format.to_string()])
                    .arg(&path)
                    .arg(format!("{}K", size));

                if let Err(err) = run_command(command, None) {
                    remove_failed_image(&path);
                    return Err(err);
                }
            }
        }

        Ok(format!("{}/{}", vmid, name))
    }

    fn free_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        is_base: bool,
        format: Option<VolumeFormat>,
    ) -> Result<Option<WorkerJob>, Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        let format = format.or(info.format);

        match info.vtype {
            ContentType::Images | ContentType::Rootdir => {
                if is_base {
                    let mut command = Command::new(CHATTR);
                    command.arg("-i").arg(&path);
                    if let Err(err) = run_command(command, None) {
                        log::warn!("unable to clear immutable flag on {:?} - {}", path, err);
                    }
                }

                if format == Some(VolumeFormat::Subvol) || info.vtype == ContentType::Rootdir {
                    std::fs::remove_dir_all(&path)
                        .map_err(|err| format_err!("removing {:?} failed - {}", path, err))?;
                } else {
                    if !path.is_file() {
                        log::warn!("disk image {:?} does not exist", path);
                        return Ok(None);
                    }
                    std::fs::remove_file(&path)
                        .map_err(|err| format_err!("unlink {:?} failed - {}", path, err))?;
                }

                // drop the per guest directory once it is empty
                if info.vtype == ContentType::Images {
                    if let Some(dir) = path.parent() {
                        remove_empty_dir(dir);
                    }
                }
            }
            ContentType::Backup => {
                if protected_marker(&path).exists() {
                    return Err(StorageError::InvariantViolation(format!(
                        "cannot delete protected backup '{}'",
                        volname
                    ))
                    .into());
                }
                std::fs::remove_file(&path)
                    .map_err(|err| format_err!("removing {:?} failed - {}", path, err))?;
                for companion in backup_companion_files(&path) {
                    if let Err(err) = remove_file_if_exists(&companion) {
                        log::warn!("{}", err);
                    }
                }
            }
            _ => {
                std::fs::remove_file(&path)
                    .map_err(|err| format_err!("removing {:?} failed - {}", path, err))?;
            }
        }

        Ok(None)
    }

    fn create_base(&self, scfg: &StorageConfig, volname: &str) -> Result<String, Error> {
        let (info, path) = self.image_path(scfg, volname)?;

        if info.vtype != ContentType::Images {
            bail!("create_base not possible on volume type '{}'", info.vtype);
        }
        if info.is_base {
            bail!("create_base not possible with base image");
        }

        let size = file_size_info(&path, info.format)?;

        if let (Some(basename), Some(basevmid)) = (&info.basename, info.basevmid) {
            let expected = format!("../{}/{}", basevmid, basename);
            if size.parent.as_deref() != Some(expected.as_str()) {
                bail!("volname '{}' contains wrong information about parent", volname);
            }
        }

        let newname = match info.name.strip_prefix("vm-") {
            Some(rest) => format!("base-{}", rest),
            None => format!("base-{}", info.name),
        };
        let vmid = info.vmid.unwrap_or_default();
        let newvolname = match (&info.basename, info.basevmid) {
            (Some(basename), Some(basevmid)) => {
                format!("{}/{}/{}/{}", basevmid, basename, vmid, newname)
            }
            _ => format!("{}/{}", vmid, newname),
        };

        let newpath = path.with_file_name(&newname);
        if newpath.exists() {
            bail!("file {:?} already exists", newpath);
        }

        std::fs::rename(&path, &newpath)
            .map_err(|err| format_err!("rename {:?} to {:?} failed - {}", path, newpath, err))?;

        // nobody should write to a base volume anymore
        if newpath.is_file() {
            if let Err(err) = std::fs::set_permissions(&newpath, Permissions::from_mode(0o444)) {
                log::warn!("unable to make {:?} read-only - {}", newpath, err);
            }
            let mut command = Command::new(CHATTR);
            command.arg("+i").arg(&newpath);
            if let Err(err) = run_command(command, None) {
                log::warn!("unable to set immutable flag on {:?} - {}", newpath, err);
            }
        }

        Ok(newvolname)
    }

    fn clone_image(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        vmid: u32,
        snapname: Option<&str>,
    ) -> Result<String, Error> {
        let info = self.parse(volname)?;

        if info.vtype != ContentType::Images {
            bail!("clone_image on wrong vtype '{}'", info.vtype);
        }
        if snapname.is_some() {
            bail!("this storage type does not support clone_image on snapshot");
        }
        let format = match info.format {
            Some(VolumeFormat::Subvol) | None => {
                bail!("this storage type does not support clone_image on subvolumes")
            }
            Some(format) => format,
        };
        if !info.is_base {
            return Err(StorageError::InvariantViolation(format!(
                "clone_image only works on base images, '{}' is not a base image",
                volname
            ))
            .into());
        }

        let basevmid = info.vmid.unwrap_or_default();
        let imagedir = base_path(scfg)?
            .join(content_subdir(ContentType::Images))
            .join(vmid.to_string());
        proxmox_sys::fs::create_path(&imagedir, None, None)
            .map_err(|err| format_err!("unable to create directory {:?} - {}", imagedir, err))?;

        let existing = list_dir_names(&imagedir)?;
        let name = get_next_vm_diskname(&existing, scfg.id(), vmid, Some(VolumeFormat::Qcow2), true)?;

        log::info!(
            "clone {}: {}, {}, {} to {} (base=../{}/{})",
            volname,
            info.vtype,
            info.name,
            vmid,
            name,
            basevmid,
            info.name
        );

        let newvol = format!("{}/{}/{}/{}", basevmid, info.name, vmid, name);

        // relative backing file, so the storage can be moved
        let mut command = Command::new(QEMU_IMG);
        command
            .arg("create")
            .arg("-b")
            .arg(format!("../{}/{}", basevmid, info.name))
            .args(["-F", &format.to_string()])
            .args(["-f", "qcow2"])
            .arg(imagedir.join(&name));
        run_command(command, None)?;

        Ok(newvol)
    }

    fn volume_size_info(&self, scfg: &StorageConfig, volname: &str) -> Result<VolumeSize, Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        file_size_info(&path, info.format)
    }

    fn volume_resize(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        size: u64,
        running: bool,
    ) -> Result<(), Error> {
        let (info, path) = self.image_path(scfg, volname)?;

        match info.format {
            Some(VolumeFormat::Raw) | Some(VolumeFormat::Qcow2) => (),
            _ => bail!("can't resize this image format"),
        }

        if running {
            // the running QEMU instance resizes the image itself
            return Ok(());
        }

        if info.format == Some(VolumeFormat::Raw) {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
            file.set_len(size)
                .map_err(|err| format_err!("resizing {:?} failed - {}", path, err))?;
        } else {
            let mut command = Command::new(QEMU_IMG);
            command
                .args(["resize", "-f", "qcow2"])
                .arg(&path)
                .arg(size.to_string());
            run_command(command, None)?;
        }

        Ok(())
    }

    fn volume_snapshot(&self, scfg: &StorageConfig, volname: &str, snap: &str) -> Result<(), Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        self.qcow2_only(&info, volname)?;

        let mut command = Command::new(QEMU_IMG);
        command.args(["snapshot", "-c", snap]).arg(&path);
        run_command(command, None)?;
        Ok(())
    }

    fn volume_snapshot_rollback(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
    ) -> Result<(), Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        self.qcow2_only(&info, volname)?;

        let mut command = Command::new(QEMU_IMG);
        command.args(["snapshot", "-a", snap]).arg(&path);
        run_command(command, None)?;
        Ok(())
    }

    fn volume_snapshot_delete(
        &self,
        scfg: &StorageConfig,
        volname: &str,
        snap: &str,
        running: bool,
    ) -> Result<(), Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        self.qcow2_only(&info, volname)?;

        if running {
            // internal snapshots of running guests are removed by QEMU
            return Ok(());
        }

        let mut command = Command::new(QEMU_IMG);
        command.args(["snapshot", "-d", snap]).arg(&path);
        run_command(command, None)?;
        Ok(())
    }

    fn volume_snapshot_list(&self, scfg: &StorageConfig, volname: &str) -> Result<Vec<String>, Error> {
        let (info, path) = self.image_path(scfg, volname)?;
        if info.format != Some(VolumeFormat::Qcow2) {
            return Ok(Vec::new());
        }

        let mut snapshots = qemu_img_info(&path, info.format)?.snapshots;
        snapshots.sort_by_key(|snap| snap.date_sec);
        Ok(snapshots.into_iter().map(|snap| snap.name).collect())
    }

    fn volume_has_feature(
        &self,
        _scfg: &StorageConfig,
        feature: VolumeFeature,
        volname: &str,
        snapname: Option<&str>,
        _running: bool,
    ) -> Result<bool, Error> {
        let info = self.parse(volname)?;
        let format = match info.format {
            Some(format) => format,
            None => return Ok(false),
        };
        Ok(file_feature(feature, FeatureKey::new(info.is_base, snapname), format))
    }

    fn volume_rename(
        &self,
        scfg: &StorageConfig,
        source_volname: &str,
        target_vmid: u32,
        target_volname: Option<&str>,
    ) -> Result<String, Error> {
        let (info, old_path) = self.image_path(scfg, source_volname)?;
        if info.vtype != ContentType::Images {
            bail!("rename is only supported for disk images");
        }

        let basedir = base_path(scfg)?.join(content_subdir(ContentType::Images));
        let target_dir = basedir.join(target_vmid.to_string());
        proxmox_sys::fs::create_path(&target_dir, None, None)
            .map_err(|err| format_err!("unable to create directory {:?} - {}", target_dir, err))?;

        let target_name = match target_volname {
            Some(name) => {
                check_new_image_name(name, target_vmid)?;
                if parse_image_file_name(name)?.0 != info.format.unwrap_or(VolumeFormat::Raw) {
                    bail!("target volume '{}' has the wrong format", name);
                }
                name.to_string()
            }
            None => {
                let existing = list_dir_names(&target_dir)?;
                get_next_vm_diskname(&existing, scfg.id(), target_vmid, info.format, true)?
            }
        };

        let new_path = target_dir.join(&target_name);
        if new_path.exists() {
            bail!("target volume '{}' already exists", target_name);
        }

        std::fs::rename(&old_path, &new_path)
            .map_err(|err| format_err!("rename {:?} to {:?} failed - {}", old_path, new_path, err))?;

        Ok(match (&info.basename, info.basevmid) {
            (Some(basename), Some(basevmid)) => {
                format!("{}/{}/{}/{}", basevmid, basename, target_vmid, target_name)
            }
            _ => format!("{}/{}", target_vmid, target_name),
        })
    }

    fn activate_storage(
        &self,
        scfg: &StorageConfig,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let path = base_path(scfg)?;

        self.backend.activate(scfg, path, task)?;

        if !path.is_dir() {
            return Err(StorageError::BackendUnavailable {
                storeid: scfg.id().to_string(),
                reason: format!("unable to activate storage - directory {:?} does not exist", path),
            }
            .into());
        }

        if mkdir_allowed(scfg) {
            let content = match scfg.common().content_types()? {
                Some(content) => content,
                None => self.plugin_data().default_content.iter().copied().collect(),
            };
            for vtype in content {
                let subdir = path.join(content_subdir(vtype));
                proxmox_sys::fs::create_path(&subdir, None, None)
                    .map_err(|err| format_err!("unable to create directory {:?} - {}", subdir, err))?;
            }
        }

        Ok(())
    }

    fn deactivate_storage(&self, scfg: &StorageConfig) -> Result<(), Error> {
        self.backend.deactivate(scfg, base_path(scfg)?)
    }

    fn status(&self, scfg: &StorageConfig) -> Result<PluginStatus, Error> {
        let path = base_path(scfg)?;
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|err| format_err!("statvfs {:?} failed - {}", path, err))?;

        let frsize = stat.fragment_size() as u64;
        let total = stat.blocks() as u64 * frsize;
        let avail = stat.blocks_available() as u64 * frsize;
        let used = total.saturating_sub(stat.blocks_free() as u64 * frsize);

        Ok(PluginStatus {
            total,
            avail,
            used,
            active: true,
        })
    }

    fn check_connection(&self, scfg: &StorageConfig) -> Result<bool, Error> {
        self.backend.check_connection(scfg)
    }

    fn on_add_hook(
        &self,
        scfg: &StorageConfig,
        password: Option<&str>,
        cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        self.backend.on_add_hook(scfg, password, cluster_fs)
    }

    fn on_delete_hook(
        &self,
        scfg: &StorageConfig,
        cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        self.backend.on_delete_hook(scfg, cluster_fs)
    }
}
