use std::path::Path;
use std::process::Command;

use anyhow::{bail, format_err, Error};

use pve_storage_api_types::{ContentType, StorageConfig, StorageError, StorageType, VolumeFormat};
use pve_storage_buildcfg::BACKEND_QUERY_TIMEOUT;
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{run_command, run_command_timeout, task_log};

use super::file_based::is_mounted;
use super::{FileBackend, PluginData};

const NFS_PLUGIN_DATA: PluginData = PluginData {
    content: &[
        ContentType::Images,
        ContentType::Rootdir,
        ContentType::Vztmpl,
        ContentType::Iso,
        ContentType::Backup,
        ContentType::Snippets,
        ContentType::Import,
    ],
    default_content: &[ContentType::Images],
    formats: &[VolumeFormat::Raw, VolumeFormat::Qcow2, VolumeFormat::Vmdk],
    fixed_options: &["path", "server", "export"],
};

/// NFS share, mounted below the configured path.
pub struct NfsBackend;

fn nfs_config(scfg: &StorageConfig) -> Result<&pve_storage_api_types::NfsStorageConfig, Error> {
    match scfg {
        StorageConfig::Nfs(config) => Ok(config),
        other => bail!("storage '{}' is not an NFS storage", other.id()),
    }
}

/// Mount source as it appears in the mount table.
fn nfs_source(server: &str, export: &str) -> String {
    // IPv6 addresses need brackets
    if server.contains(':') && !server.starts_with('[') {
        format!("[{}]:{}", server, export)
    } else {
        format!("{}:{}", server, export)
    }
}

impl FileBackend for NfsBackend {
    fn storage_type(&self) -> StorageType {
        StorageType::Nfs
    }

    fn plugin_data(&self) -> &'static PluginData {
        &NFS_PLUGIN_DATA
    }

    fn activate(
        &self,
        scfg: &StorageConfig,
        path: &Path,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let config = nfs_config(scfg)?;
        let source = nfs_source(&config.server, &config.export);

        if is_mounted(path, |entry| entry.fstype.starts_with("nfs") && entry.source == source)? {
            return Ok(());
        }

        proxmox_sys::fs::create_path(path, None, None)
            .map_err(|err| format_err!("unable to create mount point {:?} - {}", path, err))?;

        task_log!(task, "mounting {} at {:?}", source, path);

        let mut command = Command::new("/bin/mount");
        command.args(["-t", "nfs"]).arg(&source).arg(path);
        if let Some(options) = &config.options {
            command.args(["-o", options]);
        }
        run_command(command, None).map_err(|err| StorageError::BackendUnavailable {
            storeid: config.storage.clone(),
            reason: err.to_string(),
        })?;

        Ok(())
    }

    fn deactivate(&self, scfg: &StorageConfig, path: &Path) -> Result<(), Error> {
        let config = nfs_config(scfg)?;
        let source = nfs_source(&config.server, &config.export);

        if is_mounted(path, |entry| entry.source == source)? {
            let mut command = Command::new("/bin/umount");
            command.arg(path);
            run_command(command, None)?;
        }
        Ok(())
    }

    fn check_connection(&self, scfg: &StorageConfig) -> Result<bool, Error> {
        let config = nfs_config(scfg)?;

        let mut command = Command::new("/sbin/showmount");
        command.args(["--no-headers", "--exports"]).arg(&config.server);

        match run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None) {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<StorageError>() {
                Some(StorageError::CommandTimeout { .. }) => Err(err),
                _ => {
                    log::debug!("NFS server '{}' not reachable - {}", config.server, err);
                    Ok(false)
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nfs_source() {
        assert_eq!(nfs_source("10.0.0.1", "/export"), "10.0.0.1:/export");
        assert_eq!(nfs_source("fd00::1", "/export"), "[fd00::1]:/export");
        assert_eq!(nfs_source("[fd00::1]", "/export"), "[fd00::1]:/export");
    }
}
