//! Basic API types used by most of the storage code.

use proxmox_schema::{const_regex, ApiStringFormat, ArraySchema, IntegerSchema, Schema, StringSchema};

#[rustfmt::skip]
#[macro_export]
macro_rules! STORAGE_ID_REGEX_STR { () => { r"(?:[A-Za-z][A-Za-z0-9\-_.]*[A-Za-z0-9])" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! SNAPSHOT_NAME_REGEX_STR { () => { r"(?:[A-Za-z][A-Za-z0-9_\-]*)" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! VOLUME_NAME_CHAR_RE { () => { r"[^/\s]" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! ISO_EXT_RE { () => { r"\.(?i:iso|img)" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! VZTMPL_EXT_RE { () => { r"\.tar\.(?i:gz|xz|zst|bz2)" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! BACKUP_EXT_RE { () => { r"\.(?:tgz|(?:tar|vma)(?:\.(?:gz|lzo|zst))?)" }; }

#[rustfmt::skip]
#[macro_export]
macro_rules! IMPORT_EXT_RE { () => { r"\.(?:ova|ovf|qcow2|raw|vmdk)" }; }

#[rustfmt::skip]
#[macro_use]
mod local_macros {
    macro_rules! DNS_LABEL { () => (r"(?:[a-zA-Z0-9](?:[a-zA-Z0-9\-]*[a-zA-Z0-9])?)") }
}

mod error;
pub use error::StorageError;

mod prune;
pub use prune::*;

mod replication;
pub use replication::*;

mod storage;
pub use storage::*;

pub mod volume;
pub use volume::{
    parse_volume_id, BackupArchiveInfo, SnapshotSelection, VolumeFormat, VolumeId, VolumeName,
};

const_regex! {
    pub HOSTNAME_REGEX = concat!(r"^", DNS_LABEL!(), r"$");

    pub SHA256_HEX_REGEX = r"^[a-f0-9]{64}$";

    pub STORAGE_ID_REGEX = concat!(r"^", STORAGE_ID_REGEX_STR!(), r"$");

    pub SNAPSHOT_NAME_REGEX = concat!(r"^", SNAPSHOT_NAME_REGEX_STR!(), r"$");

    /// Absolute path without parent directory references.
    pub SAFE_PATH_REGEX = r"^/(?:[^/\x00]+/?)*$";

    pub ZFS_POOL_REGEX = r"^[a-zA-Z0-9][a-zA-Z0-9_\-.:]*(?:/[a-zA-Z0-9_\-.:]+)*$";

    pub LVM_VGNAME_REGEX = r"^[a-zA-Z0-9+_.][a-zA-Z0-9+_.\-]*$";
}

pub const HOSTNAME_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&HOSTNAME_REGEX);
pub const STORAGE_ID_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&STORAGE_ID_REGEX);
pub const PVE_CONFIG_DIGEST_FORMAT: ApiStringFormat = ApiStringFormat::Pattern(&SHA256_HEX_REGEX);

pub const SAFE_PATH_FORMAT: ApiStringFormat = ApiStringFormat::VerifyFn(|path| {
    if !SAFE_PATH_REGEX.is_match(path) || path.split('/').any(|c| c == "." || c == "..") {
        anyhow::bail!("path must be absolute and may not contain '.' or '..' components");
    }
    Ok(())
});

/// Lowest guest ID handed out by the cluster.
pub const VMID_MIN: u32 = 100;
/// Highest guest ID handed out by the cluster.
pub const VMID_MAX: u32 = 999_999_999;

/// Disk indexes are searched in `0..MAX_DISK_INDEX`.
pub const MAX_DISK_INDEX: u32 = 4096;

pub const VMID_SCHEMA: Schema = IntegerSchema::new("The (unique) ID of the guest.")
    .minimum(VMID_MIN as isize)
    .maximum(VMID_MAX as isize)
    .schema();

pub const NODE_SCHEMA: Schema = StringSchema::new("Cluster node name.")
    .format(&HOSTNAME_FORMAT)
    .schema();

pub const NODE_ARRAY_SCHEMA: Schema = ArraySchema::new("Node name list.", &NODE_SCHEMA).schema();

pub const NODE_LIST_SCHEMA: Schema = StringSchema::new("A list of node names, comma separated.")
    .format(&ApiStringFormat::PropertyString(&NODE_ARRAY_SCHEMA))
    .schema();

pub const STORAGE_ID_SCHEMA: Schema = StringSchema::new("Storage ID.")
    .format(&STORAGE_ID_FORMAT)
    .min_length(2)
    .max_length(64)
    .schema();

pub const VOLUME_ID_SCHEMA: Schema = StringSchema::new("Volume identifier (<storage>:<volname>).")
    .min_length(3)
    .max_length(4096)
    .schema();

pub const SAFE_PATH_SCHEMA: Schema = StringSchema::new("Absolute file system path.")
    .format(&SAFE_PATH_FORMAT)
    .max_length(4096)
    .schema();

pub const PVE_CONFIG_DIGEST_SCHEMA: Schema = StringSchema::new(
    "Prevent changes if current configuration file has different \
    SHA256 digest. This can be used to prevent concurrent \
    modifications.",
)
.format(&PVE_CONFIG_DIGEST_FORMAT)
.schema();

pub const BANDWIDTH_LIMIT_SCHEMA: Schema =
    IntegerSchema::new("Bandwidth limit in bytes per second.")
        .minimum(1)
        .schema();

/// Parse and range check a guest ID.
///
/// Only ASCII digits are accepted, so the value can safely be used as path component.
pub fn parse_vmid(text: &str) -> Result<u32, StorageError> {
    if text.is_empty()
        || text.len() > 9
        || text.starts_with('0')
        || !text.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(StorageError::Parse(format!("invalid vmid '{}'", text)));
    }
    let vmid: u32 = text
        .parse()
        .map_err(|_| StorageError::Parse(format!("invalid vmid '{}'", text)))?;
    if !(VMID_MIN..=VMID_MAX).contains(&vmid) {
        return Err(StorageError::Parse(format!(
            "vmid '{}' out of range ({}-{})",
            text, VMID_MIN, VMID_MAX
        )));
    }
    Ok(vmid)
}

/// Verify a storage ID against [`STORAGE_ID_SCHEMA`].
pub fn check_storage_id(storeid: &str) -> Result<(), StorageError> {
    if storeid.len() < 2 || storeid.len() > 64 || !STORAGE_ID_REGEX.is_match(storeid) {
        return Err(StorageError::Parse(format!("invalid storage ID '{}'", storeid)));
    }
    Ok(())
}

#[test]
fn test_parse_vmid() {
    assert_eq!(parse_vmid("100").unwrap(), 100);
    assert_eq!(parse_vmid("999999999").unwrap(), 999_999_999);
    assert!(parse_vmid("99").is_err());
    assert!(parse_vmid("0100x").is_err());
    assert!(parse_vmid("0100").is_err());
    assert!(parse_vmid("+100").is_err());
    assert!(parse_vmid("1000000000").is_err());
    assert!(parse_vmid("").is_err());

    assert!(check_storage_id("local-zfs").is_ok());
    assert!(check_storage_id("dir1").is_ok());
    assert!(check_storage_id("1dir").is_err());
    assert!(check_storage_id("a/b").is_err());
}
