use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::Error;

use proxmox_section_config::SectionConfigData;

use pve_storage_api_types::volume::archive_info;
use pve_storage_api_types::{
    parse_volume_id, ContentType, KeepOptions, PruneEntry, PruneMark, StorageError,
};
use pve_storage_tools::task::WorkerTaskContext;
use pve_storage_tools::{task_log, task_warn};

use super::StorageContext;

fn mark_selections<F: Fn(&PruneEntry) -> Result<String, Error>>(
    mark: &mut HashMap<String, PruneMark>,
    list: &[PruneEntry],
    keep: usize,
    select_id: F,
) -> Result<(), Error> {
    let mut include_hash = HashSet::new();

    let mut already_included = HashSet::new();
    for entry in list {
        if let Some(PruneMark::Keep) = mark.get(&entry.volid) {
            already_included.insert(select_id(entry)?);
        }
    }

    for entry in list {
        if mark.contains_key(&entry.volid) {
            continue;
        }
        let sel_id = select_id(entry)?;

        if already_included.contains(&sel_id) {
            continue;
        }

        if !include_hash.contains(&sel_id) {
            if include_hash.len() >= keep {
                break;
            }
            include_hash.insert(sel_id);
            mark.insert(entry.volid.clone(), PruneMark::Keep);
        } else {
            mark.insert(entry.volid.clone(), PruneMark::Remove);
        }
    }

    Ok(())
}

/// Mark the backups of one guest. `list` must be sorted newest first.
///
/// Entries already marked (protected, renamed) are left alone and do not
/// count towards any keep option.
pub(crate) fn compute_prune_marks(list: &mut [PruneEntry], options: &KeepOptions) -> Result<(), Error> {
    if !options.keeps_something() {
        for entry in list.iter_mut() {
            if entry.mark == PruneMark::Remove {
                entry.mark = PruneMark::Keep;
            }
        }
        return Ok(());
    }

    let mut mark = HashMap::new();
    for entry in list.iter() {
        if entry.mark != PruneMark::Remove {
            mark.insert(entry.volid.clone(), entry.mark);
        }
    }

    if let Some(keep_last) = options.keep_last {
        mark_selections(&mut mark, list, keep_last as usize, |entry| {
            Ok(entry.ctime.to_string())
        })?;
    }

    use proxmox_time::strftime_utc;

    let selections = [
        (options.keep_hourly, "%Y/%m/%d/%H"),
        (options.keep_daily, "%Y/%m/%d"),
        (options.keep_weekly, "%G/%V"),
        (options.keep_monthly, "%Y/%m"),
        (options.keep_yearly, "%Y"),
    ];

    for (keep, format) in selections {
        if let Some(keep) = keep {
            mark_selections(&mut mark, list, keep as usize, |entry| {
                strftime_utc(format, entry.ctime)
            })?;
        }
    }

    for entry in list.iter_mut() {
        entry.mark = mark.get(&entry.volid).copied().unwrap_or(PruneMark::Remove);
    }

    Ok(())
}

impl StorageContext {
    /// Apply the retention options to the backups on `storeid`.
    ///
    /// Backups are grouped by guest type and vmid, each group is marked on its
    /// own. Unless `dry_run` is set, backups marked `remove` are deleted; a
    /// failed removal is logged and does not stop the others. Returns all
    /// considered backups with their mark.
    #[allow(clippy::too_many_arguments)]
    pub fn prune_backups(
        &self,
        cfg: &SectionConfigData,
        storeid: &str,
        vmid: Option<u32>,
        guest_type: Option<&str>,
        keep: &KeepOptions,
        dry_run: bool,
        task: &dyn WorkerTaskContext,
    ) -> Result<Vec<PruneEntry>, Error> {
        let scfg = self.storage_check_enabled(cfg, storeid, None)?;
        let plugin = self.plugin_for(&scfg)?;

        if !self.content_types(&scfg, plugin)?.contains(&ContentType::Backup) {
            return Err(StorageError::Config(format!(
                "storage '{}' does not support backups",
                storeid
            ))
            .into());
        }

        let backups = self.volume_list(cfg, storeid, vmid, Some(ContentType::Backup))?;

        let mut groups: BTreeMap<(String, Option<u32>), Vec<PruneEntry>> = BTreeMap::new();

        for volume in backups {
            let (_, volname) = parse_volume_id(&volume.volid)?;
            let archive = match archive_info(&volname) {
                Ok(archive) => archive,
                Err(err) => {
                    log::debug!("skipping '{}' - {}", volume.volid, err);
                    continue;
                }
            };

            if let Some(guest_type) = guest_type {
                if archive.guest_type != guest_type {
                    continue;
                }
            }

            let mark = if volume.protected {
                PruneMark::Protected
            } else if !archive.is_std_name() {
                PruneMark::Renamed
            } else {
                PruneMark::Remove
            };

            let entry = PruneEntry {
                volid: volume.volid,
                vmid: archive.vmid.or(volume.vmid),
                guest_type: archive.guest_type.clone(),
                ctime: archive.ctime.or(volume.ctime).unwrap_or(0),
                mark,
            };

            groups
                .entry((archive.guest_type, entry.vmid))
                .or_default()
                .push(entry);
        }

        let mut result = Vec::new();

        for ((guest_type, group_vmid), mut list) in groups {
            list.sort_by(|a, b| b.ctime.cmp(&a.ctime));
            compute_prune_marks(&mut list, keep)?;

            if let Some(group_vmid) = group_vmid {
                task_log!(task, "prune {} backups of guest {}", guest_type, group_vmid);
            }

            for entry in &list {
                if entry.mark != PruneMark::Remove {
                    continue;
                }
                if dry_run {
                    task_log!(task, "would remove '{}'", entry.volid);
                    continue;
                }
                task_log!(task, "removing '{}'", entry.volid);
                if let Err(err) = self.vdisk_free(cfg, &entry.volid) {
                    task_warn!(task, "removing '{}' failed - {}", entry.volid, err);
                }
            }

            result.append(&mut list);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(volid: &str, time: &str) -> PruneEntry {
        PruneEntry {
            volid: volid.to_string(),
            vmid: Some(100),
            guest_type: "qemu".to_string(),
            ctime: proxmox_time::parse_rfc3339(time).unwrap(),
            mark: PruneMark::Remove,
        }
    }

    fn kept(list: &[PruneEntry]) -> Vec<&str> {
        list.iter()
            .filter(|entry| entry.mark.keep())
            .map(|entry| entry.volid.as_str())
            .collect()
    }

    fn sample() -> Vec<PruneEntry> {
        vec![
            entry("a", "2023-01-05T10:00:00Z"),
            entry("b", "2023-01-05T08:00:00Z"),
            entry("c", "2023-01-04T23:30:00Z"),
            entry("d", "2023-01-04T01:00:00Z"),
            entry("e", "2022-12-31T12:00:00Z"),
        ]
    }

    #[test]
    fn test_keep_last() -> Result<(), Error> {
        let mut list = sample();
        let options = KeepOptions {
            keep_last: Some(2),
            ..Default::default()
        };
        compute_prune_marks(&mut list, &options)?;
        assert_eq!(kept(&list), vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn test_keep_daily_uses_utc() -> Result<(), Error> {
        let mut list = sample();
        let options = KeepOptions {
            keep_daily: Some(3),
            ..Default::default()
        };
        compute_prune_marks(&mut list, &options)?;
        // newest of 2023-01-05, 2023-01-04 and 2022-12-31
        assert_eq!(kept(&list), vec!["a", "c", "e"]);
        Ok(())
    }

    #[test]
    fn test_keep_last_and_yearly() -> Result<(), Error> {
        let mut list = sample();
        let options = KeepOptions {
            keep_last: Some(1),
            keep_yearly: Some(2),
            ..Default::default()
        };
        compute_prune_marks(&mut list, &options)?;
        // 2023 is covered by keep-last already
        assert_eq!(kept(&list), vec!["a", "e"]);
        Ok(())
    }

    #[test]
    fn test_protected_not_counted() -> Result<(), Error> {
        let mut list = sample();
        list[0].mark = PruneMark::Protected;
        let options = KeepOptions {
            keep_last: Some(1),
            ..Default::default()
        };
        compute_prune_marks(&mut list, &options)?;
        assert_eq!(list[0].mark, PruneMark::Protected);
        assert_eq!(list[1].mark, PruneMark::Keep);
        assert!(list[2..].iter().all(|entry| entry.mark == PruneMark::Remove));
        Ok(())
    }

    #[test]
    fn test_no_options_keeps_all() -> Result<(), Error> {
        let mut list = sample();
        compute_prune_marks(&mut list, &KeepOptions::default())?;
        assert!(list.iter().all(|entry| entry.mark == PruneMark::Keep));
        Ok(())
    }
}
