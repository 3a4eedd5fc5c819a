use std::path::Path;

use anyhow::Error;

use pve_storage::plugin::PluginRegistry;
use pve_storage_api_types::{KeepOptions, PruneEntry, PruneMark, StorageError};

mod common;
use common::*;

const NEWEST: &str = "vzdump-qemu-100-2023_01_05-10_00_00.vma.zst";
const MIDDLE: &str = "vzdump-qemu-100-2023_01_04-10_00_00.vma.zst";
const PROTECTED: &str = "vzdump-qemu-100-2023_01_03-10_00_00.vma.zst";
const OTHER_GUEST: &str = "vzdump-qemu-101-2023_01_02-10_00_00.vma.zst";
const RENAMED: &str = "vzdump-qemu-100-before-upgrade.vma.zst";

fn create_backups(store: &Path) -> Result<(), Error> {
    let dump = store.join("dump");
    std::fs::create_dir_all(&dump)?;
    for name in [NEWEST, MIDDLE, PROTECTED, OTHER_GUEST, RENAMED] {
        std::fs::write(dump.join(name), b"backup")?;
    }
    std::fs::write(dump.join(format!("{}.protected", PROTECTED)), b"")?;
    Ok(())
}

fn mark_of(list: &[PruneEntry], name: &str) -> Option<PruneMark> {
    let volid = format!("dir1:backup/{}", name);
    list.iter()
        .find(|entry| entry.volid == volid)
        .map(|entry| entry.mark)
}

fn keep_last(n: u64) -> KeepOptions {
    KeepOptions {
        keep_last: Some(n),
        ..Default::default()
    }
}

#[test]
fn test_prune_keep_last() -> Result<(), Error> {
    let store = tempfile::tempdir()?;
    create_backups(store.path())?;
    let env = TestEnv::new(&dir_storage_cfg(store.path()), PluginRegistry::with_default_plugins())?;
    let cfg = env.config()?;
    let task = TestTask::default();

    let list = env
        .ctx
        .prune_backups(&cfg, "dir1", None, None, &keep_last(1), true, &task)?;
    assert_eq!(list.len(), 5);
    assert_eq!(mark_of(&list, NEWEST), Some(PruneMark::Keep));
    assert_eq!(mark_of(&list, MIDDLE), Some(PruneMark::Remove));
    assert_eq!(mark_of(&list, PROTECTED), Some(PruneMark::Protected));
    assert_eq!(mark_of(&list, RENAMED), Some(PruneMark::Renamed));
    assert_eq!(mark_of(&list, OTHER_GUEST), Some(PruneMark::Keep));

    // dry run leaves everything in place
    let dump = store.path().join("dump");
    assert!(dump.join(MIDDLE).exists());

    env.ctx
        .prune_backups(&cfg, "dir1", None, None, &keep_last(1), false, &task)?;

    assert!(!dump.join(MIDDLE).exists());
    for name in [NEWEST, PROTECTED, OTHER_GUEST, RENAMED] {
        assert!(dump.join(name).exists(), "{} was removed", name);
    }
    assert!(task.warnings().is_empty());

    Ok(())
}

#[test]
fn test_prune_filters() -> Result<(), Error> {
    let store = tempfile::tempdir()?;
    create_backups(store.path())?;
    let env = TestEnv::new(&dir_storage_cfg(store.path()), PluginRegistry::with_default_plugins())?;
    let cfg = env.config()?;
    let task = TestTask::default();

    let list = env
        .ctx
        .prune_backups(&cfg, "dir1", Some(101), None, &keep_last(1), true, &task)?;
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].vmid, Some(101));

    let list = env
        .ctx
        .prune_backups(&cfg, "dir1", None, Some("lxc"), &keep_last(1), true, &task)?;
    assert!(list.is_empty());

    // without keep options nothing is removed
    let list = env
        .ctx
        .prune_backups(&cfg, "dir1", None, None, &KeepOptions::default(), false, &task)?;
    assert!(list.iter().all(|entry| entry.mark.keep()));
    assert!(store.path().join("dump").join(MIDDLE).exists());

    Ok(())
}

#[test]
fn test_prune_needs_backup_content() -> Result<(), Error> {
    let plugin = MemPoolPlugin::default();
    let env = TestEnv::new(POOL_STORAGE_CFG, plugin.registry())?;
    let cfg = env.config()?;
    let task = TestTask::default();

    let err = env
        .ctx
        .prune_backups(&cfg, "tank", None, None, &keep_last(1), true, &task)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Config(_))
    ));

    Ok(())
}
