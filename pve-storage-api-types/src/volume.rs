//! Volume identifiers and volume name grammars.
//!
//! A volume is addressed cluster wide as `<storeid>:<volname>`. The layout
//! of `volname` depends on the backend family:
//!
//! * directory style (dir, nfs, cifs): `<vmid>/<name>.<fmt>`, linked clones
//!   `<basevmid>/<basename>/<vmid>/<name>`, and `iso/`, `vztmpl/`, `backup/`,
//!   `snippets/`, `import/`, `rootdir/` prefixed content
//! * pool style (zfs): `[<basename>/]<name>`
//! * LVM style: `vm-<vmid>-<name>`
//!
//! Everything in here is pure string processing, nothing touches the disk.

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::{check_storage_id, parse_vmid, ContentType, StorageError};

#[api]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Disk image format.
pub enum VolumeFormat {
    /// Raw disk image.
    Raw,
    /// QEMU image format.
    Qcow2,
    /// VMware image format.
    Vmdk,
    /// Container subvolume (a directory or file system).
    Subvol,
}

serde_plain::derive_display_from_serialize!(VolumeFormat);
serde_plain::derive_fromstr_from_deserialize!(VolumeFormat);

lazy_static! {
    static ref VOLUME_ID_REGEX: Regex =
        Regex::new(concat!(r"^(", STORAGE_ID_REGEX_STR!(), r"):(.+)$")).unwrap();

    static ref IMAGE_FILE_REGEX: Regex = Regex::new(concat!(
        r"^((base-)?", VOLUME_NAME_CHAR_RE!(), r"+)\.(raw|qcow2|vmdk|subvol)$"
    ))
    .unwrap();

    static ref LINKED_IMAGE_REGEX: Regex = Regex::new(concat!(
        r"^(\d+)/(", VOLUME_NAME_CHAR_RE!(), r"+)/(\d+)/(", VOLUME_NAME_CHAR_RE!(), r"+)$"
    ))
    .unwrap();

    static ref IMAGE_REGEX: Regex =
        Regex::new(concat!(r"^(\d+)/(", VOLUME_NAME_CHAR_RE!(), r"+)$")).unwrap();

    static ref ISO_REGEX: Regex = Regex::new(concat!(r"^iso/([^/]+", ISO_EXT_RE!(), r")$")).unwrap();

    static ref VZTMPL_REGEX: Regex =
        Regex::new(concat!(r"^vztmpl/([^/]+", VZTMPL_EXT_RE!(), r")$")).unwrap();

    static ref ROOTDIR_REGEX: Regex = Regex::new(r"^rootdir/(\d+)$").unwrap();

    static ref BACKUP_REGEX: Regex =
        Regex::new(concat!(r"^backup/([^/]+", BACKUP_EXT_RE!(), r")$")).unwrap();

    static ref BACKUP_OWNER_REGEX: Regex = Regex::new(r"^vzdump-(?:openvz|lxc|qemu)-(\d+)-.+").unwrap();

    static ref SNIPPETS_REGEX: Regex = Regex::new(r"^snippets/([^/]+)$").unwrap();

    static ref IMPORT_REGEX: Regex =
        Regex::new(concat!(r"^import/([^/]+", IMPORT_EXT_RE!(), r")$")).unwrap();

    static ref POOL_VOLNAME_REGEX: Regex = Regex::new(concat!(
        r"^(?:((base|basevol)-(\d+)-", VOLUME_NAME_CHAR_RE!(), r"+)/)?",
        r"((base|basevol|vm|subvol)-(\d+)-", VOLUME_NAME_CHAR_RE!(), r"+)$"
    ))
    .unwrap();

    static ref LVM_VOLNAME_REGEX: Regex =
        Regex::new(concat!(r"^((vm|base)-(\d+)-", VOLUME_NAME_CHAR_RE!(), r"+)$")).unwrap();

    static ref BACKUP_ARCHIVE_REGEX: Regex = Regex::new(concat!(
        r"^(vzdump-(lxc|openvz|qemu)-.+", r"\.(tgz|(?:tar|vma)(?:\.(gz|lzo|zst))?))$"
    ))
    .unwrap();

    static ref BACKUP_STD_NAME_REGEX: Regex = Regex::new(
        r"^vzdump-(?:lxc|openvz|qemu)-([1-9][0-9]{2,8})-(\d{4})_(\d{2})_(\d{2})-(\d{2})_(\d{2})_(\d{2})\."
    )
    .unwrap();
}

/// Storage wide unique volume address `<storeid>:<volname>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId {
    pub storeid: String,
    pub volname: String,
}

impl VolumeId {
    pub fn new<S: Into<String>, V: Into<String>>(storeid: S, volname: V) -> Result<Self, StorageError> {
        let storeid = storeid.into();
        let volname = volname.into();
        check_storage_id(&storeid)?;
        if volname.is_empty() {
            return Err(StorageError::Parse("empty volume name".to_string()));
        }
        Ok(Self { storeid, volname })
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.storeid, self.volname)
    }
}

impl FromStr for VolumeId {
    type Err = StorageError;

    fn from_str(volid: &str) -> Result<Self, Self::Err> {
        let (storeid, volname) = parse_volume_id(volid)?;
        Ok(Self { storeid, volname })
    }
}

/// Split a volume ID into storage ID and volume name.
pub fn parse_volume_id(volid: &str) -> Result<(String, String), StorageError> {
    if let Some(caps) = VOLUME_ID_REGEX.captures(volid) {
        let storeid = caps[1].to_string();
        check_storage_id(&storeid)?;
        return Ok((storeid, caps[2].to_string()));
    }
    Err(StorageError::Parse(format!("unable to parse volume ID '{}'", volid)))
}

/// Parsed volume name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeName {
    pub vtype: ContentType,
    /// The file (or dataset/LV) name, without any owner prefix.
    pub name: String,
    /// Owner of the volume.
    pub vmid: Option<u32>,
    /// For linked clones: name of the base volume.
    pub basename: Option<String>,
    /// For linked clones: owner of the base volume.
    pub basevmid: Option<u32>,
    pub is_base: bool,
    pub format: Option<VolumeFormat>,
}

impl VolumeName {
    fn content(vtype: ContentType, name: &str, vmid: Option<u32>) -> Self {
        Self {
            vtype,
            name: name.to_string(),
            vmid,
            basename: None,
            basevmid: None,
            is_base: false,
            format: None,
        }
    }

    /// Whether this volume is a linked clone of a base volume.
    pub fn is_linked(&self) -> bool {
        self.basename.is_some()
    }
}

fn check_file_name(vtype: ContentType, name: &str) -> Result<(), StorageError> {
    if name.starts_with('.') {
        return Err(StorageError::Parse(format!(
            "invalid {} file name '{}' - must not start with '.'",
            vtype, name
        )));
    }
    Ok(())
}

/// Parse an image file name (`[base-]<name>.<fmt>`), returns `(format, is_base)`.
pub fn parse_image_file_name(name: &str) -> Result<(VolumeFormat, bool), StorageError> {
    check_file_name(ContentType::Images, name)?;
    match IMAGE_FILE_REGEX.captures(name) {
        Some(caps) => {
            let format = caps[3]
                .parse()
                .map_err(|_| StorageError::Parse(format!("unknown format in '{}'", name)))?;
            Ok((format, caps.get(2).is_some()))
        }
        None => Err(StorageError::Parse(format!(
            "unable to parse volume filename '{}'",
            name
        ))),
    }
}

fn parse_linked_image(caps: &Captures) -> Result<VolumeName, StorageError> {
    let basevmid = parse_vmid(&caps[1])?;
    let basename = &caps[2];
    let (_, base_is_base) = parse_image_file_name(basename)?;
    if !base_is_base {
        return Err(StorageError::Parse(format!(
            "linked clone references '{}', which is not a base volume",
            basename
        )));
    }
    let vmid = parse_vmid(&caps[3])?;
    let name = &caps[4];
    let (format, is_base) = parse_image_file_name(name)?;
    Ok(VolumeName {
        vtype: ContentType::Images,
        name: name.to_string(),
        vmid: Some(vmid),
        basename: Some(basename.to_string()),
        basevmid: Some(basevmid),
        is_base,
        format: Some(format),
    })
}

fn parse_image(caps: &Captures) -> Result<VolumeName, StorageError> {
    let vmid = parse_vmid(&caps[1])?;
    let name = &caps[2];
    let (format, is_base) = parse_image_file_name(name)?;
    Ok(VolumeName {
        vtype: ContentType::Images,
        name: name.to_string(),
        vmid: Some(vmid),
        basename: None,
        basevmid: None,
        is_base,
        format: Some(format),
    })
}

fn parse_iso(caps: &Captures) -> Result<VolumeName, StorageError> {
    check_file_name(ContentType::Iso, &caps[1])?;
    Ok(VolumeName::content(ContentType::Iso, &caps[1], None))
}

fn parse_vztmpl(caps: &Captures) -> Result<VolumeName, StorageError> {
    check_file_name(ContentType::Vztmpl, &caps[1])?;
    Ok(VolumeName::content(ContentType::Vztmpl, &caps[1], None))
}

fn parse_rootdir(caps: &Captures) -> Result<VolumeName, StorageError> {
    let vmid = parse_vmid(&caps[1])?;
    Ok(VolumeName::content(ContentType::Rootdir, &caps[1], Some(vmid)))
}

fn parse_backup(caps: &Captures) -> Result<VolumeName, StorageError> {
    let name = &caps[1];
    check_file_name(ContentType::Backup, name)?;
    // archives of guests with out of range IDs are still listed, just without an owner
    let vmid = BACKUP_OWNER_REGEX
        .captures(name)
        .and_then(|owner| parse_vmid(&owner[1]).ok());
    Ok(VolumeName::content(ContentType::Backup, name, vmid))
}

fn parse_snippets(caps: &Captures) -> Result<VolumeName, StorageError> {
    check_file_name(ContentType::Snippets, &caps[1])?;
    Ok(VolumeName::content(ContentType::Snippets, &caps[1], None))
}

fn parse_import(caps: &Captures) -> Result<VolumeName, StorageError> {
    check_file_name(ContentType::Import, &caps[1])?;
    Ok(VolumeName::content(ContentType::Import, &caps[1], None))
}

struct VolnameGrammar {
    vtype: ContentType,
    /// cheap structural test, decides which grammar is responsible
    prefix: fn(&str) -> bool,
    regex: &'static Regex,
    parse: fn(&Captures) -> Result<VolumeName, StorageError>,
}

fn starts_with_digit(volname: &str) -> bool {
    volname.as_bytes().first().map(u8::is_ascii_digit).unwrap_or(false)
}

lazy_static! {
    /// Directory layout grammars, in priority order. The first one whose
    /// regular expression matches wins.
    static ref DIR_GRAMMARS: [VolnameGrammar; 8] = [
        VolnameGrammar {
            vtype: ContentType::Images,
            prefix: starts_with_digit,
            regex: &LINKED_IMAGE_REGEX,
            parse: parse_linked_image,
        },
        VolnameGrammar {
            vtype: ContentType::Images,
            prefix: starts_with_digit,
            regex: &IMAGE_REGEX,
            parse: parse_image,
        },
        VolnameGrammar {
            vtype: ContentType::Iso,
            prefix: |v| v.starts_with("iso/"),
            regex: &ISO_REGEX,
            parse: parse_iso,
        },
        VolnameGrammar {
            vtype: ContentType::Vztmpl,
            prefix: |v| v.starts_with("vztmpl/"),
            regex: &VZTMPL_REGEX,
            parse: parse_vztmpl,
        },
        VolnameGrammar {
            vtype: ContentType::Rootdir,
            prefix: |v| v.starts_with("rootdir/"),
            regex: &ROOTDIR_REGEX,
            parse: parse_rootdir,
        },
        VolnameGrammar {
            vtype: ContentType::Backup,
            prefix: |v| v.starts_with("backup/"),
            regex: &BACKUP_REGEX,
            parse: parse_backup,
        },
        VolnameGrammar {
            vtype: ContentType::Snippets,
            prefix: |v| v.starts_with("snippets/"),
            regex: &SNIPPETS_REGEX,
            parse: parse_snippets,
        },
        VolnameGrammar {
            vtype: ContentType::Import,
            prefix: |v| v.starts_with("import/"),
            regex: &IMPORT_REGEX,
            parse: parse_import,
        },
    ];
}

/// Parse a volume name of a directory style storage.
pub fn parse_dir_volname(volname: &str) -> Result<VolumeName, StorageError> {
    let mut attempted = None;

    for grammar in DIR_GRAMMARS.iter() {
        if !(grammar.prefix)(volname) {
            continue;
        }
        if let Some(caps) = grammar.regex.captures(volname) {
            return (grammar.parse)(&caps);
        }
        attempted.get_or_insert(grammar.vtype);
    }

    match attempted {
        Some(vtype) => Err(StorageError::Parse(format!(
            "unable to parse {} volume name '{}'",
            vtype, volname
        ))),
        None => Err(StorageError::Parse(format!(
            "unable to parse directory volume name '{}'",
            volname
        ))),
    }
}

/// Inverse of [`parse_dir_volname`].
pub fn format_dir_volname(info: &VolumeName) -> String {
    match info.vtype {
        ContentType::Images => match (&info.basename, info.basevmid) {
            (Some(basename), Some(basevmid)) => format!(
                "{}/{}/{}/{}",
                basevmid,
                basename,
                info.vmid.unwrap_or_default(),
                info.name
            ),
            _ => format!("{}/{}", info.vmid.unwrap_or_default(), info.name),
        },
        ContentType::Rootdir => format!("rootdir/{}", info.vmid.unwrap_or_default()),
        vtype => format!("{}/{}", vtype, info.name),
    }
}

/// Parse a volume name of a pool style storage (`[base-X-disk-N/]vm-Y-disk-M`).
pub fn parse_pool_volname(volname: &str) -> Result<VolumeName, StorageError> {
    let caps = POOL_VOLNAME_REGEX.captures(volname).ok_or_else(|| {
        StorageError::Parse(format!("unable to parse zfs volume name '{}'", volname))
    })?;

    let prefix = &caps[5];
    let format = if prefix == "subvol" || prefix == "basevol" {
        VolumeFormat::Subvol
    } else {
        VolumeFormat::Raw
    };

    let basevmid = match caps.get(3) {
        Some(m) => Some(parse_vmid(m.as_str())?),
        None => None,
    };

    Ok(VolumeName {
        vtype: ContentType::Images,
        name: caps[4].to_string(),
        vmid: Some(parse_vmid(&caps[6])?),
        basename: caps.get(1).map(|m| m.as_str().to_string()),
        basevmid,
        is_base: prefix == "base" || prefix == "basevol",
        format: Some(format),
    })
}

/// Inverse of [`parse_pool_volname`].
pub fn format_pool_volname(info: &VolumeName) -> String {
    match &info.basename {
        Some(basename) => format!("{}/{}", basename, info.name),
        None => info.name.clone(),
    }
}

/// Parse a logical volume name (`vm-<vmid>-<name>` or `base-<vmid>-<name>`).
pub fn parse_lvm_volname(volname: &str) -> Result<VolumeName, StorageError> {
    let caps = LVM_VOLNAME_REGEX.captures(volname).ok_or_else(|| {
        StorageError::Parse(format!("unable to parse lvm volume name '{}'", volname))
    })?;

    Ok(VolumeName {
        vtype: ContentType::Images,
        name: caps[1].to_string(),
        vmid: Some(parse_vmid(&caps[3])?),
        basename: None,
        basevmid: None,
        is_base: &caps[2] == "base",
        format: Some(VolumeFormat::Raw),
    })
}

/// Information encoded in a backup archive file name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArchiveInfo {
    pub filename: String,
    /// Guest type (`qemu`, `lxc` or `openvz`).
    pub guest_type: String,
    /// Archive format (`tar`, `vma`, `tgz`).
    pub format: String,
    pub compression: Option<String>,
    /// Only set for archives following the standard naming scheme.
    pub vmid: Option<u32>,
    /// Creation time encoded in the name. The wall clock time from the name is
    /// interpreted as UTC, so it must be formatted with UTC helpers again.
    pub ctime: Option<i64>,
}

impl BackupArchiveInfo {
    pub fn is_std_name(&self) -> bool {
        self.ctime.is_some()
    }
}

/// Parse a backup archive file name (`vzdump-<type>-<vmid>-<YYYY_MM_DD-hh_mm_ss>.<ext>`).
pub fn archive_info(filename: &str) -> Result<BackupArchiveInfo, StorageError> {
    let filename = filename.rsplit('/').next().unwrap_or(filename);

    let caps = BACKUP_ARCHIVE_REGEX.captures(filename).ok_or_else(|| {
        StorageError::Parse(format!("unable to parse backup archive name '{}'", filename))
    })?;

    let extension = &caps[3];
    let format = extension.split('.').next().unwrap_or(extension).to_string();

    let mut info = BackupArchiveInfo {
        filename: caps[1].to_string(),
        guest_type: caps[2].to_string(),
        format,
        compression: caps.get(4).map(|m| m.as_str().to_string()),
        vmid: None,
        ctime: None,
    };

    if let Some(std) = BACKUP_STD_NAME_REGEX.captures(filename) {
        let timestamp = format!(
            "{}-{}-{}T{}:{}:{}Z",
            &std[2], &std[3], &std[4], &std[5], &std[6], &std[7]
        );
        if let Ok(ctime) = proxmox_time::parse_rfc3339(&timestamp) {
            info.vmid = parse_vmid(&std[1]).ok();
            info.ctime = Some(ctime);
        }
    }

    Ok(info)
}

/// Which snapshots an operation (e.g. a copy) should carry along.
///
/// Older callers passed a plain boolean; [`SnapshotSelection::as_bool`] gives
/// that view, treating any selection of snapshots as `true`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SnapshotSelection {
    #[default]
    NoSnapshots,
    AllSnapshots,
    /// Snapshots in order, oldest first. Consumers may ignore the list and
    /// treat it like [`SnapshotSelection::AllSnapshots`].
    OrderedSnapshotList(Vec<String>),
}

impl SnapshotSelection {
    pub fn as_bool(&self) -> bool {
        match self {
            SnapshotSelection::NoSnapshots => false,
            SnapshotSelection::AllSnapshots => true,
            SnapshotSelection::OrderedSnapshotList(list) => !list.is_empty(),
        }
    }
}

impl From<bool> for SnapshotSelection {
    fn from(with_snapshots: bool) -> Self {
        if with_snapshots {
            SnapshotSelection::AllSnapshots
        } else {
            SnapshotSelection::NoSnapshots
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dir_roundtrip(volname: &str) -> VolumeName {
        let info = parse_dir_volname(volname).unwrap();
        assert_eq!(format_dir_volname(&info), volname);
        info
    }

    #[test]
    fn test_volume_id() {
        let volid: VolumeId = "local:100/vm-100-disk-0.raw".parse().unwrap();
        assert_eq!(volid.storeid, "local");
        assert_eq!(volid.volname, "100/vm-100-disk-0.raw");
        assert_eq!(volid.to_string(), "local:100/vm-100-disk-0.raw");

        // only the first colon separates storage and volume name
        let (storeid, volname) = parse_volume_id("nfs1:iso/a:b.iso").unwrap();
        assert_eq!((storeid.as_str(), volname.as_str()), ("nfs1", "iso/a:b.iso"));

        assert!(parse_volume_id("local").is_err());
        assert!(parse_volume_id("local:").is_err());
        assert!(parse_volume_id(":100/vm-100-disk-0.raw").is_err());
        assert!(parse_volume_id("lo/cal:100/vm-100-disk-0.raw").is_err());
    }

    #[test]
    fn test_parse_images() {
        let info = dir_roundtrip("100/vm-100-disk-0.raw");
        assert_eq!(info.vtype, ContentType::Images);
        assert_eq!(info.vmid, Some(100));
        assert_eq!(info.format, Some(VolumeFormat::Raw));
        assert!(!info.is_base);

        let info = dir_roundtrip("100/base-100-disk-1.qcow2");
        assert!(info.is_base);
        assert_eq!(info.format, Some(VolumeFormat::Qcow2));

        let info = dir_roundtrip("100/base-100-disk-1.qcow2/101/vm-101-disk-0.qcow2");
        assert_eq!(info.vmid, Some(101));
        assert_eq!(info.basevmid, Some(100));
        assert_eq!(info.basename.as_deref(), Some("base-100-disk-1.qcow2"));
        assert_eq!(info.name, "vm-101-disk-0.qcow2");
        assert!(info.is_linked());

        dir_roundtrip("200/subvol-200-disk-0.subvol");
        dir_roundtrip("300/vm-300-disk-2.vmdk");
    }

    #[test]
    fn test_parse_content() {
        let info = dir_roundtrip("iso/debian-12.iso");
        assert_eq!((info.vtype, info.name.as_str()), (ContentType::Iso, "debian-12.iso"));

        dir_roundtrip("vztmpl/debian-12-standard_12.2-1_amd64.tar.zst");
        dir_roundtrip("snippets/userdata.yaml");
        dir_roundtrip("import/appliance.ova");

        let info = dir_roundtrip("rootdir/105");
        assert_eq!(info.vmid, Some(105));

        let info = dir_roundtrip("backup/vzdump-qemu-100-2024_01_02-03_04_05.vma.zst");
        assert_eq!(info.vtype, ContentType::Backup);
        assert_eq!(info.vmid, Some(100));

        let info = dir_roundtrip("backup/other-archive.tar.gz");
        assert_eq!(info.vmid, None);

        // owner ID outside the valid range
        let info = dir_roundtrip("backup/vzdump-qemu-99-2024_01_02-03_04_05.vma.zst");
        assert_eq!(info.vtype, ContentType::Backup);
        assert_eq!(info.vmid, None);
    }

    #[test]
    fn test_reject_malformed() {
        for volname in [
            "100/vm-100-disk-0.txt",
            "100/../vm-100-disk-0.raw",
            "../100/vm-100-disk-0.raw",
            "abc/vm-100-disk-0.raw",
            "99/vm-99-disk-0.raw",
            "0100/vm-100-disk-0.raw",
            "100/.vm-100-disk-0.raw",
            "100/vm-100-disk-0.qcow2/101/vm-101-disk-0.qcow2",
            "iso/image.txt",
            "iso/../secret.iso",
            "vztmpl/template.tar",
            "rootdir/abc",
            "snippets/..",
            "snippets/../../etc/passwd",
            "backup/vzdump-qemu-100.zip",
            "images/100/vm-100-disk-0.raw",
            "",
        ] {
            assert!(
                parse_dir_volname(volname).is_err(),
                "volume name '{}' should be rejected",
                volname
            );
        }
    }

    #[test]
    fn test_error_names_vtype() {
        let err = parse_dir_volname("iso/image.txt").unwrap_err();
        assert_eq!(err.to_string(), "unable to parse iso volume name 'iso/image.txt'");

        let err = parse_dir_volname("foo/bar").unwrap_err();
        assert_eq!(err.to_string(), "unable to parse directory volume name 'foo/bar'");
    }

    #[test]
    fn test_pool_volname() {
        for volname in [
            "vm-100-disk-0",
            "subvol-100-disk-0",
            "base-100-disk-0",
            "basevol-100-disk-0",
            "base-100-disk-0/vm-101-disk-0",
        ] {
            let info = parse_pool_volname(volname).unwrap();
            assert_eq!(format_pool_volname(&info), volname);
        }

        let info = parse_pool_volname("basevol-100-disk-0").unwrap();
        assert!(info.is_base);
        assert_eq!(info.format, Some(VolumeFormat::Subvol));

        let info = parse_pool_volname("base-100-disk-0/vm-101-disk-0").unwrap();
        assert_eq!(info.basevmid, Some(100));
        assert_eq!(info.vmid, Some(101));

        assert!(parse_pool_volname("vm-100-disk-0/vm-101-disk-0").is_err());
        assert!(parse_pool_volname("data/vm-100-disk-0").is_err());
        assert!(parse_pool_volname("vm-abc-disk-0").is_err());
    }

    #[test]
    fn test_lvm_volname() {
        let info = parse_lvm_volname("vm-100-disk-0").unwrap();
        assert_eq!(info.vmid, Some(100));
        assert!(!info.is_base);
        assert!(parse_lvm_volname("base-101-disk-0").unwrap().is_base);
        assert!(parse_lvm_volname("100/vm-100-disk-0.raw").is_err());
    }

    #[test]
    fn test_archive_info() {
        let info = archive_info("vzdump-lxc-101-2023_10_15-22_01_33.tar.zst").unwrap();
        assert_eq!(info.guest_type, "lxc");
        assert_eq!(info.format, "tar");
        assert_eq!(info.compression.as_deref(), Some("zst"));
        assert_eq!(info.vmid, Some(101));
        assert_eq!(info.ctime, Some(1697407293));
        assert!(info.is_std_name());

        let info = archive_info("/mnt/backup/dump/vzdump-qemu-custom.vma").unwrap();
        assert_eq!(info.vmid, None);
        assert!(!info.is_std_name());

        assert!(archive_info("backup.tar.zst").is_err());

        let info = archive_info("vzdump-qemu-99-2023_10_15-22_01_33.vma").unwrap();
        assert_eq!(info.vmid, None);
        assert_eq!(info.guest_type, "qemu");
    }

    #[test]
    fn test_snapshot_selection() {
        assert!(!SnapshotSelection::NoSnapshots.as_bool());
        assert!(SnapshotSelection::from(true).as_bool());
        assert!(!SnapshotSelection::OrderedSnapshotList(Vec::new()).as_bool());
        assert!(SnapshotSelection::OrderedSnapshotList(vec!["s1".into()]).as_bool());
    }
}
