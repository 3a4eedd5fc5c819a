use std::path::Path;

use anyhow::{format_err, Error};

use pve_storage_api_types::{ContentType, StorageConfig, StorageError, StorageType, VolumeFormat};
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::task_log;

use super::{FileBackend, PluginData};

const DIR_PLUGIN_DATA: PluginData = PluginData {
    content: &[
        ContentType::Images,
        ContentType::Rootdir,
        ContentType::Vztmpl,
        ContentType::Iso,
        ContentType::Backup,
        ContentType::Snippets,
        ContentType::Import,
    ],
    default_content: &[ContentType::Images, ContentType::Rootdir],
    formats: &[
        VolumeFormat::Raw,
        VolumeFormat::Qcow2,
        VolumeFormat::Vmdk,
        VolumeFormat::Subvol,
    ],
    fixed_options: &["path"],
};

/// Local directory.
pub struct DirBackend;

impl FileBackend for DirBackend {
    fn storage_type(&self) -> StorageType {
        StorageType::Dir
    }

    fn plugin_data(&self) -> &'static PluginData {
        &DIR_PLUGIN_DATA
    }

    fn activate(
        &self,
        scfg: &StorageConfig,
        path: &Path,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        if path.is_dir() {
            return Ok(());
        }

        let mkdir = match scfg {
            StorageConfig::Dir(config) => config.mkdir.unwrap_or(true),
            _ => true,
        };

        if !mkdir {
            return Err(StorageError::BackendUnavailable {
                storeid: scfg.id().to_string(),
                reason: format!("directory {:?} does not exist and 'mkdir' is disabled", path),
            }
            .into());
        }

        task_log!(task, "create storage directory {:?}", path);
        proxmox_sys::fs::create_path(path, None, None)
            .map_err(|err| format_err!("unable to create directory {:?} - {}", path, err))?;

        Ok(())
    }
}
