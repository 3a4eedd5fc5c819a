//! One-shot copy of a volume to another storage, possibly on another node.
//!
//! File based storages are copied with `rsync`, ZFS volumes with
//! `zfs send | zfs recv`. Other combinations are rejected.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use lazy_static::lazy_static;
use regex::Regex;

use proxmox_section_config::SectionConfigData;

use pve_storage_api_types::{
    parse_volume_id, SnapshotSelection, StorageConfig, StorageError, StorageType,
};
use pve_storage_buildcfg::{REMOTE_COMMAND_TIMEOUT, VOLUME_TRANSFER_TIMEOUT};
use pve_storage_tools::task::{try_best_effort, WorkerTaskContext};
use pve_storage_tools::{run_command_timeout, run_command_with_output, run_pipeline, task_log};

use crate::cluster::ClusterInfo;
use crate::plugin::volume_dataset;
use crate::StorageContext;

const SSH: &str = "/usr/bin/ssh";
const RSYNC: &str = "/usr/bin/rsync";
const CSTREAM: &str = "/usr/bin/cstream";
const ZFS: &str = "/sbin/zfs";

/// Transient snapshot used to copy ZFS volumes.
pub const MIGRATION_SNAPSHOT: &str = "__migration__";

/// Options for [`storage_migrate`].
#[derive(Clone, Debug, Default)]
pub struct MigrateOptions {
    /// Bandwidth limit in bytes per second.
    pub rate: Option<u64>,
    /// Copy this (existing) snapshot instead of the current state.
    pub snapshot: Option<String>,
    /// Volume name on the target storage, defaults to the source volume name.
    pub target_volname: Option<String>,
    pub with_snapshots: SnapshotSelection,
    /// Upper bound for the transfer, defaults to [`VOLUME_TRANSFER_TIMEOUT`].
    pub timeout: Option<Duration>,
}

impl MigrateOptions {
    fn transfer_timeout(&self) -> Duration {
        self.timeout.unwrap_or(VOLUME_TRANSFER_TIMEOUT)
    }
}

lazy_static! {
    static ref RSYNC_PROGRESS_REGEX: Regex = Regex::new(r"^\s*\d[\d,.]*\s+(\d+)%\s").unwrap();
}

/// Extract the percentage from an `rsync --progress` line.
///
/// Returns `None` for everything else, including garbled or partial lines.
pub fn parse_rsync_progress(line: &str) -> Option<u8> {
    let caps = RSYNC_PROGRESS_REGEX.captures(line)?;
    let percent: u8 = caps[1].parse().ok()?;
    if percent > 100 {
        return None;
    }
    Some(percent)
}

/// Where the target of a transfer lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Local,
    Remote { node: String, ip: String },
}

impl Target {
    fn resolve(cluster: &dyn ClusterInfo, node: &str) -> Result<Self, Error> {
        if node == cluster.local_node() {
            return Ok(Target::Local);
        }
        Ok(Target::Remote {
            node: node.to_string(),
            ip: cluster.remote_node_ip(node)?,
        })
    }

    /// Command running `program` on the target node.
    pub fn command(&self, program: &str) -> Command {
        match self {
            Target::Local => Command::new(program),
            Target::Remote { node, ip } => {
                let mut command = ssh_command(node, ip);
                command.arg("--").arg(program);
                command
            }
        }
    }
}

/// `ssh` invocation for non interactive commands on another cluster node.
pub fn ssh_command(node: &str, ip: &str) -> Command {
    let mut command = Command::new(SSH);
    command
        .args(["-e", "none", "-o", "BatchMode=yes"])
        .arg("-o")
        .arg(format!("HostKeyAlias={}", node))
        .arg(format!("root@{}", ip));
    command
}

/// rsync/scp style remote address, IPv6 addresses need brackets.
fn remote_path(ip: &str, path: &str) -> String {
    if ip.contains(':') {
        format!("root@[{}]:{}", ip, path)
    } else {
        format!("root@{}:{}", ip, path)
    }
}

/// Build the `zfs send [| cstream] | zfs recv` pipeline.
///
/// With `from` set, an incremental stream from `from` to `snap` is sent.
/// `recursive` includes all intermediate snapshots (`-R`, resp. `-I`).
pub fn zfs_send_pipeline(
    dataset: &str,
    from: Option<&str>,
    snap: &str,
    recursive: bool,
    target: &Target,
    target_dataset: &str,
    rate: Option<u64>,
) -> Vec<Command> {
    let mut send = Command::new(ZFS);
    send.arg("send");
    send.arg(if recursive { "-Rpv" } else { "-pv" });
    if let Some(from) = from {
        send.arg(if recursive { "-I" } else { "-i" });
        send.arg(format!("{}@{}", dataset, from));
    }
    send.arg(format!("{}@{}", dataset, snap));

    let mut pipeline = vec![send];

    if let Some(rate) = rate.filter(|rate| *rate > 0) {
        let mut cstream = Command::new(CSTREAM);
        cstream.arg("-t").arg(rate.to_string());
        pipeline.push(cstream);
    }

    let mut recv = target.command(ZFS);
    recv.args(["recv", "-F", "--", target_dataset]);
    pipeline.push(recv);

    pipeline
}

fn is_file_based(ty: StorageType) -> bool {
    matches!(ty, StorageType::Dir | StorageType::Nfs | StorageType::Cifs)
}

/// Classify a failed transfer. Errors which already carry a kind (e.g. a
/// timeout) keep it.
fn transport_error(err: Error) -> Error {
    match err.downcast::<StorageError>() {
        Ok(err) => err.into(),
        Err(err) => StorageError::Transport(err.to_string()).into(),
    }
}

/// Command removing a (partially written) file on the target.
fn remove_file_command(target: &Target, path: &str) -> Command {
    let mut rm = target.command("/bin/rm");
    rm.args(["-f", "--", path]);
    rm
}

/// Copy `volid` to storage `target_storeid` on `target_node`, returns the new volume ID.
#[allow(clippy::too_many_arguments)]
pub fn storage_migrate(
    ctx: &StorageContext,
    cfg: &SectionConfigData,
    cluster: &dyn ClusterInfo,
    volid: &str,
    target_node: &str,
    target_storeid: &str,
    opts: &MigrateOptions,
    task: &dyn WorkerTaskContext,
) -> Result<String, Error> {
    let (storeid, volname) = parse_volume_id(volid)?;
    let target_volname = opts.target_volname.clone().unwrap_or_else(|| volname.clone());
    let target_volid = format!("{}:{}", target_storeid, target_volname);

    let scfg = ctx.storage_check_enabled(cfg, &storeid, None)?;
    let target_scfg = ctx.storage_check_enabled(cfg, target_storeid, Some(target_node))?;

    let source_type = scfg.storage_type();
    let target_type = target_scfg.storage_type();

    let file_copy = is_file_based(source_type) && is_file_based(target_type);
    if !file_copy && !(source_type == StorageType::ZfsPool && target_type == StorageType::ZfsPool) {
        return Err(StorageError::UnsupportedMigration(
            source_type.to_string(),
            target_type.to_string(),
        )
        .into());
    }

    // a shared target storage is reachable from here as well
    let target_node = if target_scfg.is_shared()
        && target_scfg.common().available_on(ctx.node_name())
    {
        cluster.local_node().to_string()
    } else {
        target_node.to_string()
    };
    let target = Target::resolve(cluster, &target_node)?;

    if target == Target::Local && storeid == target_storeid && volname == target_volname {
        bail!("source and target of copy are identical ({})", volid);
    }

    ctx.activate_volumes(cfg, &[volid], opts.snapshot.as_deref())?;
    if target == Target::Local {
        ctx.activate_storage(cfg, target_storeid)?;
    }

    task_log!(task, "copy '{}' to '{}' on node '{}'", volid, target_volid, target_node);

    if file_copy {
        copy_file_volume(ctx, &scfg, &volname, &target_scfg, &target_volname, &target, opts, task)?;
    } else {
        copy_zfs_volume(ctx, &scfg, &volname, &target_scfg, &target_volname, &target, opts, task)?;
    }

    task_log!(task, "copy of '{}' finished", volid);
    Ok(target_volid)
}

#[allow(clippy::too_many_arguments)]
fn copy_file_volume(
    ctx: &StorageContext,
    scfg: &StorageConfig,
    volname: &str,
    target_scfg: &StorageConfig,
    target_volname: &str,
    target: &Target,
    opts: &MigrateOptions,
    task: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    if opts.snapshot.is_some() {
        return Err(StorageError::InvariantViolation(format!(
            "copying a snapshot is not possible on storage type '{}'",
            scfg.storage_type()
        ))
        .into());
    }

    let source = ctx.plugin_for(scfg)?.path(scfg, volname, None)?.path;
    let destination = ctx
        .plugin_for(target_scfg)?
        .path(target_scfg, target_volname, None)?
        .path;

    let target_dir = Path::new(&destination)
        .parent()
        .ok_or_else(|| format_err!("invalid target path '{}'", destination))?
        .to_string_lossy()
        .into_owned();

    let mut rsync = Command::new(RSYNC);
    rsync.args(["--progress", "--sparse", "--whole-file"]);
    if let Some(rate) = opts.rate.filter(|rate| *rate > 0) {
        // rsync wants KiB/s
        rsync.arg(format!("--bwlimit={}", rate.div_ceil(1024)));
    }
    rsync.arg(&source);

    match target {
        Target::Local => {
            std::fs::create_dir_all(&target_dir)
                .map_err(|err| format_err!("unable to create directory '{}' - {}", target_dir, err))?;
            rsync.arg(&destination);
        }
        Target::Remote { ip, .. } => {
            let mut mkdir = target.command("/bin/mkdir");
            mkdir.args(["-p", "--", &target_dir]);
            run_command_timeout(mkdir, REMOTE_COMMAND_TIMEOUT, None)?;
            rsync.arg(remote_path(ip, &destination));
        }
    }

    let mut last_percent = None;
    let result = run_command_with_output(
        rsync,
        Some(opts.transfer_timeout()),
        &mut |line: &str| match parse_rsync_progress(line) {
            Some(percent) => {
                if last_percent != Some(percent) && (percent % 10 == 0 || percent == 100) {
                    task_log!(task, "transferred {}%", percent);
                }
                last_percent = Some(percent);
            }
            None => task_log!(task, "{}", line),
        },
    );

    if let Err(err) = result {
        try_best_effort(task, "removing partial copy", || {
            run_command_timeout(
                remove_file_command(target, &destination),
                REMOTE_COMMAND_TIMEOUT,
                None,
            )
            .map(drop)
        });
        return Err(transport_error(err));
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn copy_zfs_volume(
    ctx: &StorageContext,
    scfg: &StorageConfig,
    volname: &str,
    target_scfg: &StorageConfig,
    target_volname: &str,
    target: &Target,
    opts: &MigrateOptions,
    task: &dyn WorkerTaskContext,
) -> Result<(), Error> {
    let plugin = ctx.plugin_for(scfg)?;
    let dataset = volume_dataset(scfg, volname)?;
    let target_dataset = volume_dataset(target_scfg, target_volname)?;

    let (snap, transient) = match &opts.snapshot {
        Some(snap) => (snap.clone(), false),
        None => {
            plugin.volume_snapshot(scfg, volname, MIGRATION_SNAPSHOT)?;
            (MIGRATION_SNAPSHOT.to_string(), true)
        }
    };

    let pipeline = zfs_send_pipeline(
        &dataset,
        None,
        &snap,
        opts.with_snapshots.as_bool(),
        target,
        &target_dataset,
        opts.rate,
    );

    let result = run_pipeline(pipeline, Some(opts.transfer_timeout()));

    if transient {
        try_best_effort(task, "removing transient source snapshot", || {
            plugin.volume_snapshot_delete(scfg, volname, MIGRATION_SNAPSHOT, false)
        });
        try_best_effort(task, "removing transient target snapshot", || {
            let mut destroy = target.command(ZFS);
            destroy.args(["destroy", &format!("{}@{}", target_dataset, MIGRATION_SNAPSHOT)]);
            run_command_timeout(destroy, REMOTE_COMMAND_TIMEOUT, None).map(drop)
        });
    }

    result.map_err(transport_error)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rsync_progress() {
        assert_eq!(parse_rsync_progress("    32,768   0%    0.00kB/s    0:00:00"), Some(0));
        assert_eq!(
            parse_rsync_progress("  1,073,741,824 100%  201.49MB/s    0:00:05 (xfr#1, to-chk=0/1)"),
            Some(100)
        );
        assert_eq!(parse_rsync_progress("   524,288,000  48%  100.00MB/s    0:00:05"), Some(48));
        assert_eq!(parse_rsync_progress("vm-100-disk-0.raw"), None);
        assert_eq!(parse_rsync_progress("  12,3"), None);
        assert_eq!(parse_rsync_progress("  1,000 250% 1kB/s"), None);
        assert_eq!(parse_rsync_progress(""), None);
    }

    fn args(command: &Command) -> Vec<String> {
        std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_zfs_send_pipeline() {
        let target = Target::Remote {
            node: "node2".to_string(),
            ip: "10.0.0.2".to_string(),
        };
        let pipeline = zfs_send_pipeline(
            "rpool/data/vm-100-disk-0",
            Some("replica_1000"),
            "replica_2000",
            true,
            &target,
            "tank/vm-100-disk-0",
            Some(1048576),
        );

        assert_eq!(pipeline.len(), 3);
        assert_eq!(
            args(&pipeline[0]),
            vec![
                "/sbin/zfs",
                "send",
                "-Rpv",
                "-I",
                "rpool/data/vm-100-disk-0@replica_1000",
                "rpool/data/vm-100-disk-0@replica_2000",
            ]
        );
        assert_eq!(args(&pipeline[1]), vec!["/usr/bin/cstream", "-t", "1048576"]);

        let recv = args(&pipeline[2]);
        assert_eq!(recv[0], "/usr/bin/ssh");
        assert!(recv.contains(&"HostKeyAlias=node2".to_string()));
        assert!(recv.contains(&"root@10.0.0.2".to_string()));
        assert!(recv.ends_with(&[
            "/sbin/zfs".to_string(),
            "recv".to_string(),
            "-F".to_string(),
            "--".to_string(),
            "tank/vm-100-disk-0".to_string(),
        ]));
    }

    #[test]
    fn test_full_local_send() {
        let pipeline = zfs_send_pipeline("a/b", None, "s", false, &Target::Local, "c/b", None);
        assert_eq!(pipeline.len(), 2);
        assert_eq!(args(&pipeline[0]), vec!["/sbin/zfs", "send", "-pv", "a/b@s"]);
        assert_eq!(args(&pipeline[1]), vec!["/sbin/zfs", "recv", "-F", "--", "c/b"]);
    }

    #[test]
    fn test_remove_partial_copy_on_remote_node() {
        let target = Target::Remote {
            node: "node2".to_string(),
            ip: "10.0.0.2".to_string(),
        };
        let rm = args(&remove_file_command(&target, "/mnt/images/100/vm-100-disk-0.raw"));
        assert_eq!(rm[0], "/usr/bin/ssh");
        assert!(rm.contains(&"root@10.0.0.2".to_string()));
        assert!(rm.ends_with(&[
            "--".to_string(),
            "/bin/rm".to_string(),
            "-f".to_string(),
            "--".to_string(),
            "/mnt/images/100/vm-100-disk-0.raw".to_string(),
        ]));

        let rm = args(&remove_file_command(&Target::Local, "/x"));
        assert_eq!(rm, vec!["/bin/rm", "-f", "--", "/x"]);
    }

    #[test]
    fn test_remote_path() {
        assert_eq!(remote_path("10.0.0.1", "/x"), "root@10.0.0.1:/x");
        assert_eq!(remote_path("fd00::1", "/x"), "root@[fd00::1]:/x");
    }
}
