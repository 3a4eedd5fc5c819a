use std::collections::BTreeSet;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use proxmox_schema::{api, ApiStringFormat, ArraySchema, Schema, StringSchema};

use crate::{
    VolumeFormat, HOSTNAME_FORMAT, NODE_LIST_SCHEMA, SAFE_PATH_SCHEMA, STORAGE_ID_SCHEMA,
    VOLUME_ID_SCHEMA,
};

#[api]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Content type of a volume.
pub enum ContentType {
    /// VM disk images.
    Images,
    /// Container root file systems.
    Rootdir,
    /// ISO images.
    Iso,
    /// Container templates.
    Vztmpl,
    /// Backup archives.
    Backup,
    /// Snippets (hook scripts, cloud-init user data, ...).
    Snippets,
    /// Import sources (OVA/OVF files, disk images).
    Import,
}

serde_plain::derive_display_from_serialize!(ContentType);
serde_plain::derive_fromstr_from_deserialize!(ContentType);

pub const STORAGE_CONTENT_SCHEMA: Schema = StringSchema::new("Storage content type.")
    .format(&ApiStringFormat::Enum(&[
        proxmox_schema::EnumEntry::new("images", "VM disk images."),
        proxmox_schema::EnumEntry::new("rootdir", "Container root file systems."),
        proxmox_schema::EnumEntry::new("iso", "ISO images."),
        proxmox_schema::EnumEntry::new("vztmpl", "Container templates."),
        proxmox_schema::EnumEntry::new("backup", "Backup archives."),
        proxmox_schema::EnumEntry::new("snippets", "Snippets."),
        proxmox_schema::EnumEntry::new("import", "Import sources."),
    ]))
    .schema();

pub const STORAGE_CONTENT_ARRAY_SCHEMA: Schema =
    ArraySchema::new("Content type list.", &STORAGE_CONTENT_SCHEMA).schema();

pub const STORAGE_CONTENT_LIST_SCHEMA: Schema =
    StringSchema::new("Allowed content types, comma separated.")
        .format(&ApiStringFormat::PropertyString(&STORAGE_CONTENT_ARRAY_SCHEMA))
        .schema();

/// Parse a comma separated content type list.
pub fn parse_content_list(list: &str) -> Result<BTreeSet<ContentType>, Error> {
    let mut set = BTreeSet::new();
    for item in list.split(|c: char| c == ',' || c == ';' || c.is_ascii_whitespace()) {
        if item.is_empty() {
            continue;
        }
        let content: ContentType = item
            .parse()
            .map_err(|_| format_err!("invalid content type '{}'", item))?;
        set.insert(content);
    }
    Ok(set)
}

/// Format a content type set (sorted, comma separated).
pub fn format_content_list(set: &BTreeSet<ContentType>) -> String {
    set.iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[api]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Storage backend type.
pub enum StorageType {
    /// Local directory.
    Dir,
    /// NFS share, mounted by the storage layer.
    Nfs,
    /// SMB/CIFS share, mounted by the storage layer.
    Cifs,
    /// LVM volume group.
    Lvm,
    /// ZFS pool (local).
    ZfsPool,
}

serde_plain::derive_display_from_serialize!(StorageType);
serde_plain::derive_fromstr_from_deserialize!(StorageType);

impl StorageType {
    pub const ALL: [StorageType; 5] = [
        StorageType::Dir,
        StorageType::Nfs,
        StorageType::Cifs,
        StorageType::Lvm,
        StorageType::ZfsPool,
    ];
}

#[api]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Optional volume capabilities.
pub enum VolumeFeature {
    /// Take snapshots.
    Snapshot,
    /// Create linked clones.
    Clone,
    /// Convert into a base volume.
    Template,
    /// Full copy.
    Copy,
    /// Newly allocated volumes read back zeroes.
    Sparseinit,
    /// Snapshot based incremental replication.
    Replicate,
    /// Rename the volume.
    Rename,
}

serde_plain::derive_display_from_serialize!(VolumeFeature);
serde_plain::derive_fromstr_from_deserialize!(VolumeFeature);

fn is_false(b: &bool) -> bool {
    !*b
}

#[api(
    properties: {
        content: {
            optional: true,
            schema: STORAGE_CONTENT_LIST_SCHEMA,
        },
        nodes: {
            optional: true,
            schema: NODE_LIST_SCHEMA,
        },
        shared: {
            optional: true,
            default: false,
        },
        disable: {
            optional: true,
            default: false,
        },
    }
)]
#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Properties every storage type has.
pub struct StorageCommonConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    /// The storage is accessible with identical content from all nodes.
    #[serde(default, skip_serializing_if = "is_false")]
    pub shared: bool,
    /// Flag to disable the storage.
    #[serde(default, skip_serializing_if = "is_false")]
    pub disable: bool,
}

impl StorageCommonConfig {
    /// Configured content types, `None` if unset.
    pub fn content_types(&self) -> Result<Option<BTreeSet<ContentType>>, Error> {
        self.content.as_deref().map(parse_content_list).transpose()
    }

    /// Node restriction list, `None` means all nodes.
    pub fn node_list(&self) -> Option<BTreeSet<String>> {
        self.nodes.as_deref().map(|list| {
            list.split(|c: char| c == ',' || c == ';' || c.is_ascii_whitespace())
                .filter(|n| !n.is_empty())
                .map(String::from)
                .collect()
        })
    }

    /// Whether the storage may be used on `node` (ignores the `disable` flag).
    pub fn available_on(&self, node: &str) -> bool {
        match self.node_list() {
            Some(nodes) => nodes.contains(node),
            None => true,
        }
    }
}

pub const CIFS_SMB_VERSION_SCHEMA: Schema = StringSchema::new("SMB protocol version.")
    .format(&ApiStringFormat::Enum(&[
        proxmox_schema::EnumEntry::new("default", "Let the client negotiate."),
        proxmox_schema::EnumEntry::new("2.0", "SMB 2.0"),
        proxmox_schema::EnumEntry::new("2.1", "SMB 2.1"),
        proxmox_schema::EnumEntry::new("3", "SMB 3"),
        proxmox_schema::EnumEntry::new("3.0", "SMB 3.0"),
        proxmox_schema::EnumEntry::new("3.11", "SMB 3.11"),
    ]))
    .schema();

pub const SERVER_SCHEMA: Schema = StringSchema::new("Server IP or DNS name.")
    .format(&HOSTNAME_FORMAT)
    .schema();

pub const ZFS_POOL_SCHEMA: Schema = StringSchema::new("ZFS pool or dataset name.")
    .format(&ApiStringFormat::Pattern(&crate::ZFS_POOL_REGEX))
    .max_length(256)
    .schema();

pub const LVM_VGNAME_SCHEMA: Schema = StringSchema::new("Volume group name.")
    .format(&ApiStringFormat::Pattern(&crate::LVM_VGNAME_REGEX))
    .max_length(128)
    .schema();

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        common: { type: StorageCommonConfig },
        path: { schema: SAFE_PATH_SCHEMA },
        format: { type: VolumeFormat, optional: true },
        mkdir: { optional: true, default: true },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Local directory storage.
pub struct DirStorageConfig {
    pub storage: String,
    #[serde(flatten)]
    pub common: StorageCommonConfig,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
    /// Create the directory if it does not exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mkdir: Option<bool>,
}

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        common: { type: StorageCommonConfig },
        path: { schema: SAFE_PATH_SCHEMA },
        server: { schema: SERVER_SCHEMA },
        export: { schema: SAFE_PATH_SCHEMA },
        options: {
            optional: true,
            description: "NFS mount options (see 'man nfs').",
        },
        format: { type: VolumeFormat, optional: true },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// NFS share mounted at `path`.
pub struct NfsStorageConfig {
    pub storage: String,
    #[serde(flatten)]
    pub common: StorageCommonConfig,
    pub path: String,
    pub server: String,
    pub export: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
}

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        common: { type: StorageCommonConfig },
        path: { schema: SAFE_PATH_SCHEMA },
        server: { schema: SERVER_SCHEMA },
        share: { description: "CIFS share name." },
        username: { optional: true, description: "User name for the share." },
        domain: { optional: true, description: "CIFS domain." },
        smbversion: { optional: true, schema: CIFS_SMB_VERSION_SCHEMA },
        format: { type: VolumeFormat, optional: true },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// SMB/CIFS share mounted at `path`. The password lives in a separate credentials file.
pub struct CifsStorageConfig {
    pub storage: String,
    #[serde(flatten)]
    pub common: StorageCommonConfig,
    pub path: String,
    pub server: String,
    pub share: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smbversion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
}

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        common: { type: StorageCommonConfig },
        vgname: { schema: LVM_VGNAME_SCHEMA },
        base: {
            optional: true,
            schema: VOLUME_ID_SCHEMA,
        },
        saferemove: { optional: true, default: false },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// LVM volume group.
pub struct LvmStorageConfig {
    pub storage: String,
    #[serde(flatten)]
    pub common: StorageCommonConfig,
    pub vgname: String,
    /// Volume the volume group lives on (usually an iSCSI LUN of another storage).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
    /// Zero out data when removing logical volumes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saferemove: Option<bool>,
}

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        common: { type: StorageCommonConfig },
        pool: { schema: ZFS_POOL_SCHEMA },
        blocksize: { optional: true, description: "Block size for new zvols (e.g. 8k)." },
        sparse: { optional: true, default: false },
        mountpoint: { optional: true, schema: SAFE_PATH_SCHEMA },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// ZFS pool or dataset.
pub struct ZfsPoolStorageConfig {
    pub storage: String,
    #[serde(flatten)]
    pub common: StorageCommonConfig,
    pub pool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocksize: Option<String>,
    /// Use thin provisioned zvols.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,
}

/// Typed storage configuration entry.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageConfig {
    Dir(DirStorageConfig),
    Nfs(NfsStorageConfig),
    Cifs(CifsStorageConfig),
    Lvm(LvmStorageConfig),
    ZfsPool(ZfsPoolStorageConfig),
}

macro_rules! with_config {
    ($config:expr, $inner:ident => $body:expr) => {
        match $config {
            StorageConfig::Dir($inner) => $body,
            StorageConfig::Nfs($inner) => $body,
            StorageConfig::Cifs($inner) => $body,
            StorageConfig::Lvm($inner) => $body,
            StorageConfig::ZfsPool($inner) => $body,
        }
    };
}

impl StorageConfig {
    /// Build a typed entry from a section config section.
    pub fn from_section(section_type: &str, value: Value) -> Result<Self, Error> {
        let storage_type: StorageType = section_type
            .parse()
            .map_err(|_| format_err!("unknown storage type '{}'", section_type))?;

        Ok(match storage_type {
            StorageType::Dir => StorageConfig::Dir(serde_json::from_value(value)?),
            StorageType::Nfs => StorageConfig::Nfs(serde_json::from_value(value)?),
            StorageType::Cifs => StorageConfig::Cifs(serde_json::from_value(value)?),
            StorageType::Lvm => StorageConfig::Lvm(serde_json::from_value(value)?),
            StorageType::ZfsPool => StorageConfig::ZfsPool(serde_json::from_value(value)?),
        })
    }

    /// Convert back into section type name and property object.
    pub fn to_section(&self) -> Result<(String, Value), Error> {
        let value = with_config!(self, config => serde_json::to_value(config)?);
        if !value.is_object() {
            bail!("storage config did not serialize into an object");
        }
        Ok((self.storage_type().to_string(), value))
    }

    pub fn storage_type(&self) -> StorageType {
        match self {
            StorageConfig::Dir(_) => StorageType::Dir,
            StorageConfig::Nfs(_) => StorageType::Nfs,
            StorageConfig::Cifs(_) => StorageType::Cifs,
            StorageConfig::Lvm(_) => StorageType::Lvm,
            StorageConfig::ZfsPool(_) => StorageType::ZfsPool,
        }
    }

    pub fn id(&self) -> &str {
        with_config!(self, config => &config.storage)
    }

    pub fn common(&self) -> &StorageCommonConfig {
        with_config!(self, config => &config.common)
    }

    pub fn is_shared(&self) -> bool {
        self.common().shared
    }

    pub fn is_disabled(&self) -> bool {
        self.common().disable
    }

    /// Mount point or directory of file based storages.
    pub fn path(&self) -> Option<&str> {
        match self {
            StorageConfig::Dir(config) => Some(&config.path),
            StorageConfig::Nfs(config) => Some(&config.path),
            StorageConfig::Cifs(config) => Some(&config.path),
            StorageConfig::Lvm(_) | StorageConfig::ZfsPool(_) => None,
        }
    }

    /// Default image format configured for this storage.
    pub fn format(&self) -> Option<VolumeFormat> {
        match self {
            StorageConfig::Dir(config) => config.format,
            StorageConfig::Nfs(config) => config.format,
            StorageConfig::Cifs(config) => config.format,
            StorageConfig::Lvm(_) | StorageConfig::ZfsPool(_) => None,
        }
    }

    /// Volume ID of the device this storage is built on, if any.
    pub fn base_volume(&self) -> Option<&str> {
        match self {
            StorageConfig::Lvm(config) => config.base.as_deref(),
            _ => None,
        }
    }
}

#[api(
    properties: {
        storage: { schema: STORAGE_ID_SCHEMA },
        "type": { type: StorageType },
        content: { schema: STORAGE_CONTENT_LIST_SCHEMA },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Storage status.
pub struct StorageStatus {
    pub storage: String,
    #[serde(rename = "type")]
    pub ty: StorageType,
    pub content: String,
    /// Storage is shared between nodes.
    pub shared: bool,
    /// Storage is enabled on this node.
    pub enabled: bool,
    /// Storage is activated and reachable.
    pub active: bool,
    /// Total size in bytes.
    pub total: u64,
    /// Used bytes.
    pub used: u64,
    /// Available bytes.
    pub avail: u64,
}

#[api(
    properties: {
        volid: { schema: VOLUME_ID_SCHEMA },
        content: { type: ContentType },
        format: { type: VolumeFormat, optional: true },
        vmid: { schema: crate::VMID_SCHEMA, optional: true },
        parent: { optional: true, description: "Base volume name of linked clones." },
    }
)]
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "kebab-case")]
/// Volume list entry.
pub struct VolumeInfo {
    pub volid: String,
    pub content: ContentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<VolumeFormat>,
    /// Volume size in bytes.
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Creation time (seconds since epoch), if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctime: Option<i64>,
    /// Protected backups are never removed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub protected: bool,
}

impl VolumeInfo {
    pub fn new<S: Into<String>>(volid: S, content: ContentType, size: u64) -> Self {
        Self {
            volid: volid.into(),
            content,
            format: None,
            size,
            vmid: None,
            parent: None,
            ctime: None,
            protected: false,
        }
    }
}
