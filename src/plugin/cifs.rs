use std::path::Path;
use std::process::Command;

use anyhow::{bail, format_err, Error};

use pve_storage_api_types::{
    CifsStorageConfig, ContentType, StorageConfig, StorageError, StorageType, VolumeFormat,
};
use pve_storage_buildcfg::BACKEND_QUERY_TIMEOUT;
use pve_storage_config::storage::credentials_file_name;
use pve_storage_config::ClusterFilesystem;
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{run_command, run_command_timeout, task_log};

use super::file_based::is_mounted;
use super::{FileBackend, PluginData};

const CIFS_PLUGIN_DATA: PluginData = PluginData {
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
    fixed_options: &["path", "server", "share"],
};

/// SMB/CIFS share, mounted below the configured path.
///
/// The password is stored in the cluster file system, never in the storage configuration.
pub struct CifsBackend;

fn cifs_config(scfg: &StorageConfig) -> Result<&CifsStorageConfig, Error> {
    match scfg {
        StorageConfig::Cifs(config) => Ok(config),
        other => bail!("storage '{}' is not a CIFS storage", other.id()),
    }
}

fn cifs_source(config: &CifsStorageConfig) -> String {
    if config.server.contains(':') && !config.server.starts_with('[') {
        format!("//[{}]/{}", config.server, config.share)
    } else {
        format!("//{}/{}", config.server, config.share)
    }
}

/// Mount options, `credentials` is the path of the password file.
fn mount_options(config: &CifsStorageConfig, credentials: Option<&Path>) -> String {
    let mut options = Vec::new();

    match &config.username {
        Some(username) => {
            options.push(format!("username={}", username));
            if let Some(credentials) = credentials {
                options.push(format!("credentials={}", credentials.display()));
            }
        }
        None => options.push("guest".to_string()),
    }

    options.push(format!(
        "vers={}",
        config.smbversion.as_deref().unwrap_or("default")
    ));

    if let Some(domain) = &config.domain {
        options.push(format!("domain={}", domain));
    }

    options.join(",")
}

impl CifsBackend {
    fn credentials_path(&self, config: &CifsStorageConfig) -> std::path::PathBuf {
        Path::new(pve_storage_buildcfg::CLUSTER_CONFIG_DIR).join(credentials_file_name(&config.storage))
    }
}

impl FileBackend for CifsBackend {
    fn storage_type(&self) -> StorageType {
        StorageType::Cifs
    }

    fn plugin_data(&self) -> &'static PluginData {
        &CIFS_PLUGIN_DATA
    }

    fn activate(
        &self,
        scfg: &StorageConfig,
        path: &Path,
        task: &dyn WorkerTaskContext,
    ) -> Result<(), Error> {
        let config = cifs_config(scfg)?;
        let source = cifs_source(config);

        if is_mounted(path, |entry| entry.fstype == "cifs" && entry.source == source)? {
            return Ok(());
        }

        proxmox_sys::fs::create_path(path, None, None)
            .map_err(|err| format_err!("unable to create mount point {:?} - {}", path, err))?;

        task_log!(task, "mounting {} at {:?}", source, path);

        let credentials = self.credentials_path(config);
        let credentials = if credentials.exists() {
            Some(credentials.as_path())
        } else {
            None
        };

        let mut command = Command::new("/bin/mount");
        command
            .args(["-t", "cifs"])
            .arg(&source)
            .arg(path)
            .args(["-o", &mount_options(config, credentials)]);

        run_command(command, None).map_err(|err| StorageError::BackendUnavailable {
            storeid: config.storage.clone(),
            reason: err.to_string(),
        })?;

        Ok(())
    }

    fn deactivate(&self, scfg: &StorageConfig, path: &Path) -> Result<(), Error> {
        let config = cifs_config(scfg)?;
        let source = cifs_source(config);

        if is_mounted(path, |entry| entry.source == source)? {
            let mut command = Command::new("/bin/umount");
            command.arg(path);
            run_command(command, None)?;
        }
        Ok(())
    }

    fn check_connection(&self, scfg: &StorageConfig) -> Result<bool, Error> {
        let config = cifs_config(scfg)?;

        let mut command = Command::new("/usr/bin/smbclient");
        let protocol = match config.smbversion.as_deref() {
            Some(version) if version.starts_with('2') => "smb2",
            _ => "smb3",
        };
        command.args(["-m", protocol]);
        command.args(["-d", "0", "-L"]).arg(&config.server);
        match &config.username {
            Some(username) => {
                command.args(["-U", username]);
                let credentials = self.credentials_path(config);
                if credentials.exists() {
                    command.arg("-A").arg(credentials);
                }
            }
            None => {
                command.arg("-N");
            }
        }
        if let Some(domain) = &config.domain {
            command.args(["-W", domain]);
        }

        match run_command_timeout(command, BACKEND_QUERY_TIMEOUT, None) {
            Ok(_) => Ok(true),
            Err(err) => match err.downcast_ref::<StorageError>() {
                Some(StorageError::CommandTimeout { .. }) => Err(err),
                _ => {
                    log::debug!("CIFS server '{}' not reachable - {}", config.server, err);
                    Ok(false)
                }
            },
        }
    }

    fn on_add_hook(
        &self,
        scfg: &StorageConfig,
        password: Option<&str>,
        cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        let config = cifs_config(scfg)?;

        match (password, &config.username) {
            (Some(password), Some(_)) => {
                let content = format!("password={}\n", password);
                cluster_fs.write_file(&credentials_file_name(&config.storage), content.as_bytes())?;
            }
            (Some(_), None) => bail!("a password requires a username"),
            (None, _) => (),
        }
        Ok(())
    }

    fn on_delete_hook(
        &self,
        scfg: &StorageConfig,
        cluster_fs: &dyn ClusterFilesystem,
    ) -> Result<(), Error> {
        let config = cifs_config(scfg)?;
        cluster_fs.remove_file(&credentials_file_name(&config.storage))
    }
}
