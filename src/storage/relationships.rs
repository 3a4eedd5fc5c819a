//! Base/linked clone relationships.
//!
//! There is no index of linked clones, the relationship is encoded in the
//! volume names of the clones. Everything deriving it goes through
//! [`linked_clones`].

use anyhow::Error;

use pve_storage_api_types::{parse_volume_id, StorageConfig, VolumeName};

use crate::plugin::StoragePlugin;

/// Volume IDs of all linked clones of the base volume `base` on storage `scfg`.
pub fn linked_clones(
    plugin: &dyn StoragePlugin,
    scfg: &StorageConfig,
    base: &VolumeName,
) -> Result<Vec<String>, Error> {
    let mut clones = Vec::new();

    if !base.is_base {
        return Ok(clones);
    }

    for volume in plugin.list_images(scfg, None, None)? {
        let volname = match parse_volume_id(&volume.volid) {
            Ok((_, volname)) => volname,
            Err(_) => continue,
        };
        let info = match plugin.parse_volname(&volname) {
            Ok(info) => info,
            Err(err) => {
                log::debug!("ignoring volume '{}' - {}", volume.volid, err);
                continue;
            }
        };

        if info.basename.as_deref() == Some(base.name.as_str()) && info.basevmid == base.vmid {
            clones.push(volume.volid);
        }
    }

    Ok(clones)
}
