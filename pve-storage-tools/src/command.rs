use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use pve_storage_api_types::StorageError;

/// Helper to check result from std::process::Command output
///
/// The exit_code_check() function should return true if the exit code
/// is considered successful.
pub fn command_output(
    output: std::process::Output,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<Vec<u8>, Error> {
    if !output.status.success() {
        match output.status.code() {
            Some(code) => {
                let is_ok = match exit_code_check {
                    Some(check_fn) => check_fn(code),
                    None => code == 0,
                };
                if !is_ok {
                    let msg = String::from_utf8(output.stderr)
                        .map(|m| {
                            if m.is_empty() {
                                String::from("no error message")
                            } else {
                                m.trim_end().to_string()
                            }
                        })
                        .unwrap_or_else(|_| String::from("non utf8 error message (suppressed)"));

                    bail!("status code: {} - {}", code, msg);
                }
            }
            None => bail!("terminated by signal"),
        }
    }

    Ok(output.stdout)
}

/// Helper to check result from std::process::Command output, returns String.
///
/// The exit_code_check() function should return true if the exit code
/// is considered successful.
pub fn command_output_as_string(
    output: std::process::Output,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<String, Error> {
    let output = command_output(output, exit_code_check)?;
    let output = String::from_utf8(output)?;
    Ok(output)
}

pub fn run_command(
    mut command: Command,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<String, Error> {
    let output = command
        .output()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    let output = command_output_as_string(output, exit_code_check)
        .map_err(|err| format_err!("command {:?} failed - {}", command, err))?;

    Ok(output)
}

/// Like [`run_command`], but kill the process if it does not finish within `timeout`.
///
/// A timeout is reported as [`StorageError::CommandTimeout`], so callers can tell it apart
/// from a command failing with a non-zero exit code.
pub fn run_command_timeout(
    command: Command,
    timeout: Duration,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<String, Error> {
    let description = format!("{:?}", command);

    let mut command = tokio::process::Command::from(command);
    command.kill_on_drop(true);

    let output = proxmox_async::runtime::block_on(async move {
        tokio::time::timeout(timeout, command.output()).await
    });

    let output = match output {
        Ok(output) => {
            output.map_err(|err| format_err!("failed to execute {} - {}", description, err))?
        }
        Err(_) => {
            return Err(StorageError::CommandTimeout {
                command: description,
                timeout: timeout.as_secs(),
            }
            .into())
        }
    };

    let output = command_output_as_string(output, exit_code_check)
        .map_err(|err| format_err!("command {} failed - {}", description, err))?;

    Ok(output)
}

fn drain_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut stderr = child.stderr.take()?;
    Some(std::thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stderr.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).trim_end().to_string()
    }))
}

fn join_stderr(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .filter(|msg| !msg.is_empty())
        .unwrap_or_else(|| String::from("no error message"))
}

/// Kills a process group with SIGKILL unless disarmed before `timeout` passes.
struct Watchdog {
    cancel: mpsc::Sender<()>,
    fired: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    fn start(pgid: u32, timeout: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        let handle = std::thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(timeout) {
                flag.store(true, Ordering::SeqCst);
                if let Err(err) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
                    log::warn!("unable to kill process group {} - {}", pgid, err);
                }
            }
        });

        Self {
            cancel,
            fired,
            handle,
        }
    }

    /// Stop watching. Returns `true` if the process group was killed.
    fn disarm(self) -> bool {
        let _ = self.cancel.send(());
        if self.handle.join().is_err() {
            log::warn!("command watchdog panicked");
        }
        self.fired.load(Ordering::SeqCst)
    }
}

fn disarm_watchdog(watchdog: Option<Watchdog>) -> bool {
    watchdog.map(Watchdog::disarm).unwrap_or(false)
}

fn timeout_error(description: String, timeout: Option<Duration>) -> Error {
    StorageError::CommandTimeout {
        command: description,
        timeout: timeout.map(|timeout| timeout.as_secs()).unwrap_or_default(),
    }
    .into()
}

/// Run a command and feed each output line to `outfunc` while it is running.
///
/// Both `\n` and `\r` terminate a line, so progress meters which redraw a
/// single line are reported as they update.
///
/// With a `timeout` the command runs in its own process group, which is killed
/// when the deadline passes. This is reported as [`StorageError::CommandTimeout`].
pub fn run_command_with_output(
    mut command: Command,
    timeout: Option<Duration>,
    outfunc: &mut dyn FnMut(&str),
) -> Result<(), Error> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    if timeout.is_some() {
        command.process_group(0);
    }

    let mut child = command
        .spawn()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    let watchdog = timeout.map(|timeout| Watchdog::start(child.id(), timeout));
    let stderr = drain_stderr(&mut child);

    if let Some(mut stdout) = child.stdout.take() {
        let mut line = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let count = match stdout.read(&mut buffer) {
                Ok(0) => break,
                Ok(count) => count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    disarm_watchdog(watchdog);
                    bail!("reading output of {:?} failed - {}", command, err);
                }
            };
            for byte in &buffer[..count] {
                if *byte == b'\n' || *byte == b'\r' {
                    if !line.is_empty() {
                        outfunc(&String::from_utf8_lossy(&line));
                        line.clear();
                    }
                } else {
                    line.push(*byte);
                }
            }
        }
        if !line.is_empty() {
            outfunc(&String::from_utf8_lossy(&line));
        }
    }

    let status = child.wait();
    let timed_out = disarm_watchdog(watchdog);
    let status = status.map_err(|err| format_err!("waiting for {:?} failed - {}", command, err))?;

    if !status.success() {
        if timed_out {
            return Err(timeout_error(format!("{:?}", command), timeout));
        }
        let msg = join_stderr(stderr);
        match status.code() {
            Some(code) => bail!("command {:?} failed - status code: {} - {}", command, code, msg),
            None => bail!("command {:?} failed - terminated by signal", command),
        }
    }

    Ok(())
}

/// Run a list of commands connected by pipes (`cmd1 | cmd2 | ...`).
///
/// Fails if any of the commands fails, reporting the first failing command.
/// With a `timeout` all commands share one process group, which is killed when
/// the deadline passes.
pub fn run_pipeline(mut commands: Vec<Command>, timeout: Option<Duration>) -> Result<(), Error> {
    if commands.is_empty() {
        bail!("empty command pipeline");
    }

    let count = commands.len();
    let mut children: Vec<(String, Child, Option<JoinHandle<String>>)> = Vec::with_capacity(count);
    let mut previous_stdout = None;
    let mut group: Option<u32> = None;

    for (index, command) in commands.iter_mut().enumerate() {
        if let Some(stdout) = previous_stdout.take() {
            command.stdin(Stdio::from(stdout));
        }
        if timeout.is_some() {
            command.process_group(group.map(|pgid| pgid as i32).unwrap_or(0));
        }
        if index + 1 < count {
            command.stdout(Stdio::piped());
        }
        command.stderr(Stdio::piped());

        let description = format!("{:?}", command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                for (_, mut child, _) in children {
                    let _ = child.kill();
                    let _ = child.wait();
                }
                bail!("failed to execute {} - {}", description, err);
            }
        };

        group.get_or_insert(child.id());
        previous_stdout = child.stdout.take();
        let stderr = drain_stderr(&mut child);
        children.push((description, child, stderr));
    }

    let watchdog = match (timeout, group) {
        (Some(timeout), Some(pgid)) => Some(Watchdog::start(pgid, timeout)),
        _ => None,
    };

    let mut statuses = Vec::with_capacity(count);
    for (description, mut child, stderr) in children {
        let status = child.wait();
        statuses.push((description, status, stderr));
    }
    let timed_out = disarm_watchdog(watchdog);

    let mut first_error = None;
    for (description, status, stderr) in statuses {
        let msg = join_stderr(stderr);
        if first_error.is_some() {
            continue;
        }
        match status {
            Ok(status) if status.success() => (),
            Ok(status) => {
                first_error = Some(match status.code() {
                    Some(code) => {
                        format_err!("command {} failed - status code: {} - {}", description, code, msg)
                    }
                    None => format_err!("command {} failed - terminated by signal", description),
                });
            }
            Err(err) => first_error = Some(format_err!("waiting for {} failed - {}", description, err)),
        }
    }

    match first_error {
        Some(_) if timed_out => {
            let description = commands
                .iter()
                .map(|command| format!("{:?}", command))
                .collect::<Vec<_>>()
                .join(" | ");
            Err(timeout_error(description, timeout))
        }
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_run_command_with_output_splits_carriage_returns() {
        let mut command = Command::new("printf");
        command.arg("a\rb\nc");

        let mut lines = Vec::new();
        run_command_with_output(command, None, &mut |line| lines.push(line.to_string())).unwrap();

        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_run_command_timeout() {
        let mut command = Command::new("sleep");
        command.arg("5");

        let err = run_command_timeout(command, Duration::from_millis(100), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn test_pipeline_reports_failure() {
        let mut first = Command::new("echo");
        first.arg("data");
        let second = Command::new("false");

        assert!(run_pipeline(vec![first, second], None).is_err());

        let mut first = Command::new("echo");
        first.arg("data");
        let second = Command::new("cat");
        run_pipeline(vec![first, second], Some(Duration::from_secs(10))).unwrap();
    }

    #[test]
    fn test_pipeline_timeout() {
        // the reader never sees end of file, like a hung remote receiver
        let mut first = Command::new("sleep");
        first.arg("30");
        let second = Command::new("cat");

        let err = run_pipeline(vec![first, second], Some(Duration::from_millis(200))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CommandTimeout { .. })
        ));
    }

    #[test]
    fn test_run_command_with_output_timeout() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo started; sleep 30"]);

        let mut lines = Vec::new();
        let err = run_command_with_output(command, Some(Duration::from_millis(200)), &mut |line| {
            lines.push(line.to_string())
        })
        .unwrap_err();

        assert_eq!(lines, vec!["started"]);
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::CommandTimeout { .. })
        ));
    }
}
