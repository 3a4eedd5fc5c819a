use std::sync::Arc;

use anyhow::Error;
use serde_json::json;

use pve_storage::cluster::GuestType;
use pve_storage::replication::{ReplicationEngine, ReplicationStateStore};
use pve_storage_api_types::{
    parse_replica_snapshot, replica_snapshot_name, ReplicationState, StorageError,
};
use pve_storage_buildcfg::REPLICA_MAX_FAIL_COUNT;

mod common;
use common::*;

struct Setup {
    env: TestEnv,
    plugin: MemPoolPlugin,
    guests: Arc<TestGuests>,
    transport: Arc<TestTransport>,
    engine: ReplicationEngine,
}

fn setup() -> Result<Setup, Error> {
    let plugin = MemPoolPlugin::default();
    plugin.add_volume("vm-100-disk-0", 1 << 30);
    plugin.add_volume("vm-100-disk-1", 4 << 30);

    let env = TestEnv::new(POOL_STORAGE_CFG, plugin.registry())?;

    let guests = Arc::new(TestGuests::default());
    guests.configs.lock().unwrap().insert(
        100,
        json!({
            "name": "web",
            "scsi0": "tank:vm-100-disk-0,size=1G",
            "scsi1": "tank:vm-100-disk-1,size=4G",
        }),
    );

    let transport = Arc::new(TestTransport::default());
    let cluster = Arc::new(TestCluster::with_guests(&[(100, GuestType::Qemu)]));

    let mut engine = ReplicationEngine::new(
        Arc::clone(&env.ctx),
        cluster,
        transport.clone(),
        ReplicationStateStore::new(env.path("replica")),
    );
    engine.register_guest(guests.clone());

    Ok(Setup {
        env,
        plugin,
        guests,
        transport,
        engine,
    })
}

fn replica_snapshots(plugin: &MemPoolPlugin, volname: &str) -> Vec<String> {
    plugin
        .snapshots(volname)
        .into_iter()
        .filter(|snap| parse_replica_snapshot(snap).is_some())
        .collect()
}

#[test]
fn test_enable_and_incremental_sync() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let first = setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;
    let first_snap = replica_snapshot_name(first);

    // full send of both volumes
    {
        let sent = setup.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|s| s.from.is_none() && s.snap == first_snap));
    }
    assert_eq!(
        setup.guests.configs.lock().unwrap()[&100]["replicate"],
        json!(1)
    );
    assert_eq!(replica_snapshots(&setup.plugin, "vm-100-disk-0"), vec![first_snap.clone()]);

    let second = setup.engine.sync_guest(100, &task)?;
    assert!(second > first);
    let second_snap = replica_snapshot_name(second);

    {
        let sent = setup.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        for s in &sent[2..] {
            assert_eq!(s.from.as_deref(), Some(first_snap.as_str()));
            assert_eq!(s.snap, second_snap);
        }
    }

    // only the newest replication snapshot is kept
    for volname in ["vm-100-disk-0", "vm-100-disk-1"] {
        assert_eq!(replica_snapshots(&setup.plugin, volname), vec![second_snap.clone()]);
    }
    let deleted = setup.transport.deleted.lock().unwrap().clone();
    assert!(deleted.contains(&("vm-100-disk-0".to_string(), first_snap.clone())));
    assert!(deleted.contains(&("vm-100-disk-1".to_string(), first_snap)));

    let jobs = setup.engine.state_store().load()?;
    let job = &jobs[&100];
    assert_eq!(job.lastsync, second);
    assert_eq!(job.state, ReplicationState::Ok);
    assert_eq!(job.target, TARGET_NODE);

    Ok(())
}

#[test]
fn test_failure_accounting() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let first = setup.engine.job_enable(100, TARGET_NODE, 15, Some(1 << 20), &task)?;

    setup.transport.set_fail(true);
    for attempt in 1..=REPLICA_MAX_FAIL_COUNT {
        let err = setup.engine.sync_guest(100, &task).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::Transport(_))
        ));

        let job = setup.engine.state_store().load()?[&100].clone();
        assert_eq!(job.fail, attempt);
        assert_eq!(job.lastsync, first);
        assert!(job.error.is_some());
        let expected = if attempt < REPLICA_MAX_FAIL_COUNT {
            ReplicationState::Ok
        } else {
            ReplicationState::Error
        };
        assert_eq!(job.state, expected);

        // the failed snapshot is gone again
        assert_eq!(
            replica_snapshots(&setup.plugin, "vm-100-disk-0"),
            vec![replica_snapshot_name(first)]
        );
    }
    assert!(!task.warnings().is_empty());

    // jobs in error state are not scheduled
    assert!(setup.engine.run_due_jobs(first + 24 * 3600, &task)?.is_empty());

    setup.transport.set_fail(false);
    let time = setup.engine.sync_guest(100, &task)?;

    let job = setup.engine.state_store().load()?[&100].clone();
    assert_eq!(job.lastsync, time);
    assert_eq!(job.fail, 0);
    assert_eq!(job.state, ReplicationState::Ok);
    assert!(job.error.is_none());

    Ok(())
}

#[test]
fn test_failing_snapshot_rolls_back() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;
    let before = setup.transport.sent.lock().unwrap().len();

    setup.plugin.state.lock().unwrap().fail_snapshot = Some("vm-100-disk-1".to_string());
    assert!(setup.engine.sync_guest(100, &task).is_err());

    // nothing sent, disk-0 keeps only the previous snapshot
    assert_eq!(setup.transport.sent.lock().unwrap().len(), before);
    assert_eq!(replica_snapshots(&setup.plugin, "vm-100-disk-0").len(), 1);

    Ok(())
}

#[test]
fn test_enable_checks() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let err = setup
        .engine
        .job_enable(100, LOCAL_NODE, 15, None, &task)
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StorageError>(),
        Some(StorageError::Config(_))
    ));

    // unknown guest
    assert!(setup.engine.job_enable(200, TARGET_NODE, 15, None, &task).is_err());
    assert!(setup.engine.state_store().load()?.is_empty());

    Ok(())
}

#[test]
fn test_scheduling_and_status() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let first = setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;

    let status = setup.engine.job_status()?;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].vmid, 100);
    assert!(!status[0].stale);

    assert!(setup.engine.run_due_jobs(first + 60, &task)?.is_empty());
    assert_eq!(setup.engine.run_due_jobs(first + 15 * 60, &task)?, vec![100]);

    setup.engine.job_disable(100)?;
    assert_eq!(
        setup.engine.state_store().load()?[&100].state,
        ReplicationState::Off
    );
    assert!(setup.engine.sync_guest(100, &task).is_err());
    assert!(setup.engine.run_due_jobs(first + 24 * 3600, &task)?.is_empty());

    // enabling again resumes from the existing state
    setup.engine.job_enable(100, TARGET_NODE, 30, None, &task)?;
    let job = setup.engine.state_store().load()?[&100].clone();
    assert_eq!(job.interval, 30);
    assert_eq!(job.state, ReplicationState::Ok);

    Ok(())
}

#[test]
fn test_stale_sync_state() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;

    // a sync which died without resetting its state
    let timeout = std::time::Duration::from_secs(5);
    setup.engine.state_store().update(timeout, |jobs| {
        if let Some(job) = jobs.get_mut(&100) {
            job.state = ReplicationState::Sync;
        }
        Ok(())
    })?;
    assert!(setup.engine.job_status()?[0].stale);

    {
        let _lock = setup.engine.state_store().guest_lock(100, timeout)?;
        assert!(!setup.engine.job_status()?[0].stale);
    }

    Ok(())
}

#[test]
fn test_resume_from_existing_snapshot() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let old = replica_snapshot_name(1_600_000_000);
    for volname in ["vm-100-disk-0", "vm-100-disk-1"] {
        setup
            .env
            .ctx
            .volume_snapshot(&setup.env.config()?, &format!("tank:{}", volname), &old)?;
    }

    setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;

    let sent = setup.transport.sent.lock().unwrap();
    assert!(sent.iter().all(|s| s.from.as_deref() == Some(old.as_str())));

    Ok(())
}

#[test]
fn test_job_remove() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let time = setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;
    setup.engine.job_remove(100, &task)?;

    assert!(setup.engine.state_store().load()?.is_empty());
    assert!(replica_snapshots(&setup.plugin, "vm-100-disk-0").is_empty());
    assert!(setup.guests.configs.lock().unwrap()[&100]
        .get("replicate")
        .is_none());

    let deleted = setup.transport.deleted.lock().unwrap().clone();
    assert!(deleted.contains(&("vm-100-disk-1".to_string(), replica_snapshot_name(time))));

    assert!(setup.engine.job_remove(100, &task).is_err());

    Ok(())
}

fn disable_from_outside(setup: &Setup) {
    // a second handle on the same state, like an administrator running `job_disable`
    let store = ReplicationStateStore::new(setup.env.path("replica"));
    setup.transport.on_next_send(move || {
        store
            .update(std::time::Duration::from_secs(5), |jobs| {
                if let Some(job) = jobs.get_mut(&100) {
                    job.state = ReplicationState::Off;
                }
                Ok(())
            })
            .unwrap();
    });
}

#[test]
fn test_disable_during_sync_is_kept() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let first = setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;

    disable_from_outside(&setup);
    let time = setup.engine.sync_guest(100, &task)?;

    let job = setup.engine.state_store().load()?[&100].clone();
    assert_eq!(job.state, ReplicationState::Off);
    assert_eq!(job.lastsync, time);
    assert!(setup.engine.run_due_jobs(first + 24 * 3600, &task)?.is_empty());

    Ok(())
}

#[test]
fn test_disable_during_failing_sync_is_kept() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    let first = setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;

    setup.transport.set_fail(true);
    disable_from_outside(&setup);
    assert!(setup.engine.sync_guest(100, &task).is_err());

    let job = setup.engine.state_store().load()?[&100].clone();
    assert_eq!(job.state, ReplicationState::Off);
    assert_eq!(job.fail, 1);
    assert_eq!(job.lastsync, first);
    assert!(job.error.is_some());

    Ok(())
}

#[test]
fn test_base_volumes_are_skipped() -> Result<(), Error> {
    let setup = setup()?;
    let task = TestTask::default();

    setup.plugin.add_volume("base-100-disk-2", 1 << 30);
    setup
        .guests
        .configs
        .lock()
        .unwrap()
        .get_mut(&100)
        .unwrap()["scsi2"] = json!("tank:base-100-disk-2,size=1G");

    setup.engine.job_enable(100, TARGET_NODE, 15, None, &task)?;
    setup.engine.sync_guest(100, &task)?;

    let sent = setup.transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 4);
    assert!(sent.iter().all(|s| s.volname != "base-100-disk-2"));
    assert!(replica_snapshots(&setup.plugin, "base-100-disk-2").is_empty());

    let job = setup.engine.state_store().load()?[&100].clone();
    assert_eq!(job.state, ReplicationState::Ok);
    assert_eq!(job.fail, 0);
    assert!(!task.warnings().is_empty());

    Ok(())
}
