//! The storage configuration (`storage.cfg`).

use std::collections::HashMap;

use anyhow::{format_err, Error};
use lazy_static::lazy_static;

use serde_json::{Map, Value};

use proxmox_schema::{AllOfSchema, ApiType, ObjectSchemaType};
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use pve_storage_api_types::{
    CifsStorageConfig, DirStorageConfig, LvmStorageConfig, NfsStorageConfig, StorageConfig,
    StorageError, StorageType, ZfsPoolStorageConfig, STORAGE_ID_SCHEMA,
};
use pve_storage_buildcfg::{
    STORAGE_CFG_FILENAME, STORAGE_CFG_LOCKNAME, STORAGE_CFG_LOCK_TIMEOUT, STORAGE_PRIV_DIR,
};
use pve_storage_tools::lock::FileLockGuard;

use crate::ClusterFilesystem;

lazy_static! {
    pub static ref CONFIG: SectionConfig = init();
}

/// Property schema of one storage type.
pub fn storage_type_schema(ty: StorageType) -> &'static AllOfSchema {
    match ty {
        StorageType::Dir => DirStorageConfig::API_SCHEMA.unwrap_all_of_schema(),
        StorageType::Nfs => NfsStorageConfig::API_SCHEMA.unwrap_all_of_schema(),
        StorageType::Cifs => CifsStorageConfig::API_SCHEMA.unwrap_all_of_schema(),
        StorageType::Lvm => LvmStorageConfig::API_SCHEMA.unwrap_all_of_schema(),
        StorageType::ZfsPool => ZfsPoolStorageConfig::API_SCHEMA.unwrap_all_of_schema(),
    }
}

fn init() -> SectionConfig {
    let mut config = SectionConfig::new(&STORAGE_ID_SCHEMA);

    for ty in StorageType::ALL {
        let plugin = SectionConfigPlugin::new(
            ty.to_string(),
            Some(String::from("storage")),
            storage_type_schema(ty),
        );
        config.register_plugin(plugin);
    }

    config
}

/// Convert string valued properties (as passed on the command line) into
/// typed values, using the schema of storage type `ty`.
pub fn parse_storage_properties(
    ty: StorageType,
    param: &Map<String, Value>,
) -> Result<Map<String, Value>, Error> {
    let schema = storage_type_schema(ty);
    let mut result = Map::new();

    for (key, value) in param {
        let (_optional, prop_schema) = schema.lookup(key).ok_or_else(|| {
            StorageError::Config(format!("storage type '{}' has no property '{}'", ty, key))
        })?;
        let value = match value {
            Value::String(text) => prop_schema
                .parse_simple_value(text)
                .map_err(|err| StorageError::Config(format!("{}: {}", key, err)))?,
            other => other.clone(),
        };
        result.insert(key.clone(), value);
    }

    Ok(result)
}

/// Get exclusive (cluster wide) lock
pub fn lock_config(fs: &dyn ClusterFilesystem) -> Result<FileLockGuard, Error> {
    fs.lock_file(STORAGE_CFG_LOCKNAME, STORAGE_CFG_LOCK_TIMEOUT)
}

/// Read and parse the storage configuration.
///
/// Returns the parsed data and the SHA256 digest of the raw file content.
/// A missing file is an empty configuration.
pub fn config(fs: &dyn ClusterFilesystem) -> Result<(SectionConfigData, [u8; 32]), Error> {
    let content = fs.read_file(STORAGE_CFG_FILENAME)?.unwrap_or_default();
    let digest = openssl::sha::sha256(&content);

    let content = String::from_utf8(content)
        .map_err(|_| StorageError::Config(format!("{} is not valid UTF-8", STORAGE_CFG_FILENAME)))?;

    let data = CONFIG
        .parse(STORAGE_CFG_FILENAME, &content)
        .map_err(|err| StorageError::Config(format!("{}", err)))?;

    Ok((data, digest))
}

pub fn save_config(fs: &dyn ClusterFilesystem, config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(STORAGE_CFG_FILENAME, config)?;
    fs.write_file(STORAGE_CFG_FILENAME, raw.as_bytes())
}

/// Hex encoded digest, as handed out to API clients.
pub fn digest_to_hex(digest: &[u8; 32]) -> String {
    hex::encode(digest)
}

/// Fail with [`StorageError::DigestMismatch`] if `expected` is set and does
/// not match the digest of the current configuration.
pub fn check_digest(current: &[u8; 32], expected: Option<&str>) -> Result<(), Error> {
    let expected = match expected {
        Some(expected) => expected,
        None => return Ok(()),
    };

    let mut digest = [0u8; 32];
    hex::decode_to_slice(expected, &mut digest)
        .map_err(|err| format_err!("invalid digest '{}' - {}", expected, err))?;

    if &digest != current {
        return Err(StorageError::DigestMismatch.into());
    }
    Ok(())
}

/// Typed view of a single storage.
pub fn lookup_storage(config: &SectionConfigData, storeid: &str) -> Result<StorageConfig, Error> {
    let (section_type, value) = config
        .sections
        .get(storeid)
        .ok_or_else(|| StorageError::Config(format!("storage '{}' does not exist", storeid)))?;

    StorageConfig::from_section(section_type, value.clone()).map_err(|err| {
        StorageError::Config(format!("invalid configuration for storage '{}' - {}", storeid, err))
            .into()
    })
}

/// All storages, in configuration file order.
pub fn storage_list(config: &SectionConfigData) -> Result<Vec<StorageConfig>, Error> {
    let mut list = Vec::with_capacity(config.sections.len());
    for storeid in config.order.iter() {
        if config.sections.contains_key(storeid) {
            list.push(lookup_storage(config, storeid)?);
        }
    }
    // sections not mentioned in order (should not happen, but the fields are public)
    let mut rest: Vec<&String> = config
        .sections
        .keys()
        .filter(|id| !config.order.contains(id))
        .collect();
    rest.sort();
    for storeid in rest {
        list.push(lookup_storage(config, storeid)?);
    }
    Ok(list)
}

/// Insert or replace a storage section.
pub fn set_storage(config: &mut SectionConfigData, storage: &StorageConfig) -> Result<(), Error> {
    let (section_type, value) = storage.to_section()?;
    config.set_data(storage.id(), &section_type, value)
}

/// Remove a storage section, returns whether it existed.
pub fn remove_storage(config: &mut SectionConfigData, storeid: &str) -> bool {
    config.order.retain(|id| id != storeid);
    config.sections.remove(storeid).is_some()
}

/// Credentials file (CIFS password) of a storage, relative to the cluster file system.
pub fn credentials_file_name(storeid: &str) -> String {
    format!("{}/{}.pw", STORAGE_PRIV_DIR, storeid)
}

// shell completion helper
pub fn complete_storage_name(_arg: &str, _param: &HashMap<String, String>) -> Vec<String> {
    let fs = crate::LocalClusterFs::system();
    match config(&fs) {
        Ok((data, _digest)) => data.order.clone(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::LocalClusterFs;

    const STORAGE_CFG: &str = "\
dir: local
\tpath /var/lib/vz
\tcontent iso,vztmpl,backup

zfspool: local-zfs
\tpool rpool/data
\tsparse 1
\tcontent images,rootdir

lvm: san
\tvgname vg-san
\tbase iscsi:0.0.1.scsi-36001405
\tshared 1
\tcontent images
";

    #[test]
    fn test_parse_storage_cfg() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let fs = LocalClusterFs::new(dir.path());
        fs.write_file(STORAGE_CFG_FILENAME, STORAGE_CFG.as_bytes())?;

        let (data, digest) = config(&fs)?;
        assert_eq!(digest, openssl::sha::sha256(STORAGE_CFG.as_bytes()));

        let list = storage_list(&data)?;
        let ids: Vec<&str> = list.iter().map(|s| s.id()).collect();
        assert_eq!(ids, ["local", "local-zfs", "san"]);

        let san = lookup_storage(&data, "san")?;
        assert!(san.is_shared());
        assert_eq!(san.base_volume(), Some("iscsi:0.0.1.scsi-36001405"));

        match lookup_storage(&data, "local-zfs")? {
            StorageConfig::ZfsPool(zfs) => {
                assert_eq!(zfs.pool, "rpool/data");
                assert_eq!(zfs.sparse, Some(true));
            }
            other => panic!("unexpected storage type {:?}", other.storage_type()),
        }

        let err = lookup_storage(&data, "nope").unwrap_err();
        assert!(matches!(err.downcast_ref::<StorageError>(), Some(StorageError::Config(_))));

        Ok(())
    }

    #[test]
    fn test_write_read_back() -> Result<(), Error> {
        let dir = tempfile::tempdir()?;
        let fs = LocalClusterFs::new(dir.path());
        fs.write_file(STORAGE_CFG_FILENAME, STORAGE_CFG.as_bytes())?;

        let (mut data, _) = config(&fs)?;
        assert!(remove_storage(&mut data, "san"));
        assert!(!remove_storage(&mut data, "san"));
        save_config(&fs, &data)?;

        let (data2, digest2) = config(&fs)?;
        assert_eq!(storage_list(&data2)?, storage_list(&data)?);

        // writing unchanged data yields the same file, so the digest is stable
        save_config(&fs, &data2)?;
        let (_, digest3) = config(&fs)?;
        assert_eq!(digest2, digest3);

        Ok(())
    }

    #[test]
    fn test_check_digest() {
        let digest = openssl::sha::sha256(b"abc");
        let hex = digest_to_hex(&digest);
        assert!(check_digest(&digest, None).is_ok());
        assert!(check_digest(&digest, Some(&hex)).is_ok());

        let other = digest_to_hex(&openssl::sha::sha256(b"abd"));
        let err = check_digest(&digest, Some(&other)).unwrap_err();
        assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::DigestMismatch));

        assert!(check_digest(&digest, Some("zz")).is_err());
    }

    #[test]
    fn test_parse_storage_properties() -> Result<(), Error> {
        let mut param = Map::new();
        param.insert("path".into(), Value::from("/mnt/data"));
        param.insert("shared".into(), Value::from("1"));

        let parsed = parse_storage_properties(StorageType::Dir, &param)?;
        assert_eq!(parsed["path"], Value::from("/mnt/data"));
        assert_eq!(parsed["shared"], Value::Bool(true));

        param.insert("vgname".into(), Value::from("pve"));
        assert!(parse_storage_properties(StorageType::Dir, &param).is_err());

        Ok(())
    }
}
