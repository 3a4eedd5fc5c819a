//! Storage configuration management (add, update, remove).

use anyhow::{format_err, Error};
use serde_json::Value;

use pve_storage_api_types::{check_storage_id, parse_volume_id, StorageConfig, StorageError, StorageType};
use pve_storage_config::storage::{
    check_digest, digest_to_hex, lock_config, lookup_storage, remove_storage, save_config,
    set_storage, storage_list,
};
use pve_storage_tools::task::{try_best_effort, LogTaskContext};

use super::StorageContext;
use crate::plugin::StoragePlugin;

/// Keys no storage type allows to change.
const IMMUTABLE_KEYS: &[&str] = &["storage", "type"];

fn config_error(msg: String) -> Error {
    StorageError::Config(msg).into()
}

impl StorageContext {
    fn check_plugin_support(&self, scfg: &StorageConfig, plugin: &dyn StoragePlugin) -> Result<(), Error> {
        let data = plugin.plugin_data();

        if let Some(content) = scfg.common().content_types()? {
            for vtype in content {
                if !data.content.contains(&vtype) {
                    return Err(config_error(format!(
                        "storage type '{}' does not support content type '{}'",
                        scfg.storage_type(),
                        vtype
                    )));
                }
            }
        }

        if let Some(format) = scfg.format() {
            if !data.formats.contains(&format) {
                return Err(config_error(format!(
                    "storage type '{}' does not support format '{}'",
                    scfg.storage_type(),
                    format
                )));
            }
        }

        Ok(())
    }

    /// Add a new storage.
    ///
    /// `password` is handed to the plugin (e.g. CIFS credentials), it never ends up in `storage.cfg`.
    pub fn create_storage(&self, scfg: StorageConfig, password: Option<&str>) -> Result<(), Error> {
        check_storage_id(scfg.id())?;

        let plugin = self.plugin_for(&scfg)?;
        self.check_plugin_support(&scfg, plugin)?;

        let _lock = lock_config(self.cluster_fs())?;
        let (mut config, _digest) = self.read_config()?;

        if config.sections.contains_key(scfg.id()) {
            return Err(config_error(format!("storage ID '{}' already defined", scfg.id())));
        }

        plugin.on_add_hook(&scfg, password, self.cluster_fs())?;

        let result = set_storage(&mut config, &scfg).and_then(|_| save_config(self.cluster_fs(), &config));

        if let Err(err) = result {
            let task = LogTaskContext::new(format!("add {}", scfg.id()));
            try_best_effort(&task, "cleanup after failed add", || {
                plugin.on_delete_hook(&scfg, self.cluster_fs())
            });
            return Err(err);
        }

        log::info!("added storage '{}' (type {})", scfg.id(), scfg.storage_type());
        Ok(())
    }

    /// Update a storage.
    ///
    /// `param` is an object with the properties to set, `delete` lists properties
    /// to remove. Fails on digest mismatch or when a fixed option would change.
    pub fn update_storage(
        &self,
        storeid: &str,
        param: Value,
        delete: &[String],
        digest: Option<&str>,
    ) -> Result<(), Error> {
        let _lock = lock_config(self.cluster_fs())?;
        let (mut config, current_digest) = self.read_config()?;

        check_digest(&current_digest, digest)?;

        let scfg = lookup_storage(&config, storeid)?;
        let plugin = self.plugin_for(&scfg)?;
        let fixed = plugin.plugin_data().fixed_options;

        let (section_type, mut value) = scfg.to_section()?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| format_err!("storage '{}' has no properties", storeid))?;

        let check_key = |key: &str| -> Result<(), Error> {
            if IMMUTABLE_KEYS.contains(&key) || fixed.contains(&key) {
                return Err(config_error(format!(
                    "can't change value of fixed parameter '{}'",
                    key
                )));
            }
            Ok(())
        };

        if let Some(param) = param.as_object() {
            for (key, new_value) in param {
                if key == "digest" || key == "delete" {
                    continue;
                }
                if object.get(key) == Some(new_value) {
                    continue;
                }
                check_key(key)?;
                object.insert(key.clone(), new_value.clone());
            }
        } else if !param.is_null() {
            return Err(config_error("update parameters must be an object".to_string()));
        }

        for key in delete {
            check_key(key)?;
            object.remove(key.as_str());
        }

        let updated = StorageConfig::from_section(&section_type, value)
            .map_err(|err| config_error(format!("invalid update for storage '{}' - {}", storeid, err)))?;
        self.check_plugin_support(&updated, plugin)?;

        set_storage(&mut config, &updated)?;
        save_config(self.cluster_fs(), &config)?;

        log::info!("updated storage '{}'", storeid);
        Ok(())
    }

    /// Remove a storage.
    ///
    /// Refused while another storage is built on a volume of this storage (LVM `base`).
    pub fn delete_storage(&self, storeid: &str, digest: Option<&str>) -> Result<(), Error> {
        let _lock = lock_config(self.cluster_fs())?;
        let (mut config, current_digest) = self.read_config()?;

        check_digest(&current_digest, digest)?;

        let scfg = lookup_storage(&config, storeid)?;

        for other in storage_list(&config)? {
            if other.id() == storeid {
                continue;
            }
            if let Some(base) = other.base_volume() {
                if let Ok((base_storeid, _)) = parse_volume_id(base) {
                    if base_storeid == storeid {
                        return Err(config_error(format!(
                            "can't remove storage '{}' - storage '{}' is based on it",
                            storeid,
                            other.id()
                        )));
                    }
                }
            }
        }

        remove_storage(&mut config, storeid);
        save_config(self.cluster_fs(), &config)?;

        if let Ok(mut activated) = self.activated.lock() {
            activated.remove(storeid);
        }

        let task = LogTaskContext::new(format!("remove {}", storeid));
        try_best_effort(&task, "storage cleanup", || {
            self.plugin_for(&scfg)?.on_delete_hook(&scfg, self.cluster_fs())
        });

        log::info!("removed storage '{}'", storeid);
        Ok(())
    }

    /// All storages (optionally of one type) and the hex digest of the configuration.
    pub fn list_storage(&self, ty: Option<StorageType>) -> Result<(Vec<StorageConfig>, String), Error> {
        let (config, digest) = self.read_config()?;
        let list = storage_list(&config)?
            .into_iter()
            .filter(|scfg| ty.map(|ty| scfg.storage_type() == ty).unwrap_or(true))
            .collect();
        Ok((list, digest_to_hex(&digest)))
    }

    /// A single storage and the hex digest of the configuration.
    pub fn read_storage(&self, storeid: &str) -> Result<(StorageConfig, String), Error> {
        let (config, digest) = self.read_config()?;
        Ok((lookup_storage(&config, storeid)?, digest_to_hex(&digest)))
    }
}
