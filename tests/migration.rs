use std::path::Path;

use anyhow::Error;

use pve_storage::cluster::GuestType;
use pve_storage::migration::{storage_migrate, MigrateOptions};
use pve_storage::plugin::PluginRegistry;
use pve_storage_api_types::{StorageError, VolumeFormat};

mod common;
use common::*;

fn storage_cfg(dir1: &Path, dir2: &Path) -> String {
    format!(
        "dir: dir1\n\tpath {}\n\tcontent images\n\n\
         dir: dir2\n\tpath {}\n\tcontent images\n\n\
         lvm: vg1\n\tvgname vg1\n\tcontent images\n",
        dir1.display(),
        dir2.display()
    )
}

#[test]
fn test_migrate_checks() -> Result<(), Error> {
    let dir1 = tempfile::tempdir()?;
    let dir2 = tempfile::tempdir()?;
    let env = TestEnv::new(
        &storage_cfg(dir1.path(), dir2.path()),
        PluginRegistry::with_default_plugins(),
    )?;
    let cfg = env.config()?;
    let cluster = TestCluster::with_guests(&[(100, GuestType::Qemu)]);
    let task = TestTask::default();

    let volid = env
        .ctx
        .vdisk_alloc(&cfg, "dir1", 100, Some(VolumeFormat::Raw), None, 1024)?;

    let err = storage_migrate(
        &env.ctx,
        &cfg,
        &cluster,
        &volid,
        TARGET_NODE,
        "vg1",
        &MigrateOptions::default(),
        &task,
    )
    .unwrap_err();
    match err.downcast_ref::<StorageError>() {
        Some(StorageError::UnsupportedMigration(source, target)) => {
            assert_eq!(source, "dir");
            assert_eq!(target, "lvm");
        }
        other => panic!("unexpected error {:?}", other),
    }

    assert!(storage_migrate(
        &env.ctx,
        &cfg,
        &cluster,
        &volid,
        LOCAL_NODE,
        "dir1",
        &MigrateOptions::default(),
        &task,
    )
    .is_err());

    // snapshots can't be copied between directories
    let opts = MigrateOptions {
        snapshot: Some("snap1".to_string()),
        ..Default::default()
    };
    assert!(storage_migrate(&env.ctx, &cfg, &cluster, &volid, LOCAL_NODE, "dir2", &opts, &task).is_err());

    Ok(())
}

#[test]
fn test_local_file_copy() -> Result<(), Error> {
    if !Path::new("/usr/bin/rsync").exists() {
        eprintln!("rsync not installed, skipping");
        return Ok(());
    }

    let dir1 = tempfile::tempdir()?;
    let dir2 = tempfile::tempdir()?;
    let env = TestEnv::new(
        &storage_cfg(dir1.path(), dir2.path()),
        PluginRegistry::with_default_plugins(),
    )?;
    let cfg = env.config()?;
    let cluster = TestCluster::with_guests(&[(100, GuestType::Qemu)]);
    let task = TestTask::default();

    let volid = env
        .ctx
        .vdisk_alloc(&cfg, "dir1", 100, Some(VolumeFormat::Raw), None, 1024)?;

    let new_volid = storage_migrate(
        &env.ctx,
        &cfg,
        &cluster,
        &volid,
        LOCAL_NODE,
        "dir2",
        &MigrateOptions::default(),
        &task,
    )?;
    assert_eq!(new_volid, "dir2:100/vm-100-disk-0.raw");

    let copied = dir2.path().join("images/100/vm-100-disk-0.raw");
    assert_eq!(std::fs::metadata(copied)?.len(), 1024 * 1024);

    // source is untouched
    assert!(dir1.path().join("images/100/vm-100-disk-0.raw").exists());

    Ok(())
}

#[test]
fn test_failed_copy_removes_destination() -> Result<(), Error> {
    if !Path::new("/usr/bin/rsync").exists() {
        eprintln!("rsync not installed, skipping");
        return Ok(());
    }

    let dir1 = tempfile::tempdir()?;
    let dir2 = tempfile::tempdir()?;
    let env = TestEnv::new(
        &storage_cfg(dir1.path(), dir2.path()),
        PluginRegistry::with_default_plugins(),
    )?;
    let cfg = env.config()?;
    let cluster = TestCluster::with_guests(&[(100, GuestType::Qemu)]);
    let task = TestTask::default();

    // partially written by an interrupted transfer, the source is gone
    let destination = dir2.path().join("images/100/vm-100-disk-0.raw");
    std::fs::create_dir_all(destination.parent().unwrap())?;
    std::fs::write(&destination, b"partial")?;

    let err = storage_migrate(
        &env.ctx,
        &cfg,
        &cluster,
        "dir1:100/vm-100-disk-0.raw",
        LOCAL_NODE,
        "dir2",
        &MigrateOptions::default(),
        &task,
    )
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Transport(_))
    ));
    assert!(!destination.exists());

    Ok(())
}
