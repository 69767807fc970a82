//! Device process supervision.
//!
//! A [`ProcessHandle`] owns one device-control process, locally spawned or
//! wrapped in `ssh` for remote hosts. Merged stdout/stderr is consumed line
//! by line by a reader task that tees every line to the per-device log file
//! as it streams, independent of whether anyone is watching, and feeds a
//! take-once channel used for readiness detection.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::{DeviceRole, DeviceSpec, Transport};
use crate::error::LaunchError;

/// Lines of output retained for the outcome's tail.
const OUTPUT_TAIL_LINES: usize = 20;

/// Exit classification for a device process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceExit {
    /// Process exited on its own with this code.
    Code { code: i32 },
    /// The transport or program could not be started at all.
    FailedToLaunch,
    /// Still running after the capture window; force-terminated.
    KilledOnTimeout,
}

impl DeviceExit {
    /// The success sentinel: a clean zero exit.
    pub fn is_success(&self) -> bool {
        matches!(self, DeviceExit::Code { code: 0 })
    }
}

/// Result of waiting on a device process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(i32),
    TimedOut,
}

/// A live (or exited) device-control process.
pub struct ProcessHandle {
    role: DeviceRole,
    child: tokio::process::Child,
    pid: Option<u32>,
    launched_at: DateTime<Utc>,
    launched_instant: tokio::time::Instant,
    lines: Option<mpsc::UnboundedReceiver<String>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    killed: bool,
}

impl ProcessHandle {
    /// Launch the device-control process for `spec` into `run_dir`.
    ///
    /// All process output streams into `<run_dir>/<role>.log` from the
    /// moment of launch.
    pub async fn launch(spec: &DeviceSpec, run_dir: &Path, hw_trigger: bool) -> Result<ProcessHandle, LaunchError> {
        let argv = transport_argv(spec.command(run_dir, hw_trigger), &spec.transport);
        let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand)?;

        let log_path = run_dir.join(spec.role.log_filename());
        let log = tokio::fs::File::create(&log_path)
            .await
            .map_err(|source| LaunchError::LogFile {
                path: log_path.clone(),
                source,
            })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    LaunchError::ProgramNotFound {
                        program: program.clone(),
                    }
                } else {
                    LaunchError::Spawn {
                        program: program.clone(),
                        source,
                    }
                }
            })?;

        let launched_at = Utc::now();
        let launched_instant = tokio::time::Instant::now();
        let pid = child.id();
        debug!(role = %spec.role, pid = ?pid, program = %program, "device process launched");

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));

        tokio::spawn(pump_output(
            stdout,
            stderr,
            log,
            line_tx,
            Arc::clone(&tail),
        ));

        Ok(ProcessHandle {
            role: spec.role,
            child,
            pid,
            launched_at,
            launched_instant,
            lines: Some(line_rx),
            tail,
            killed: false,
        })
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wall-clock launch time, recorded on the device outcome.
    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    /// Monotonic launch instant; readiness timeouts are anchored here so
    /// each device gets its own clock.
    pub fn launched_instant(&self) -> tokio::time::Instant {
        self.launched_instant
    }

    /// Take the live output line stream. Yields `None` on the second call;
    /// only one watcher may consume a device's output.
    pub fn take_lines(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.lines.take()
    }

    /// Last lines of merged output, for the outcome's stderr tail.
    pub fn output_tail(&self) -> String {
        let tail = self.tail.lock().expect("tail lock");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Wait for natural exit, bounded by `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => WaitOutcome::Exited(status.code().unwrap_or(-1)),
            Ok(Err(_)) => WaitOutcome::Exited(-1),
            Err(_) => WaitOutcome::TimedOut,
        }
    }

    /// Force-terminate the process. Idempotent and safe after natural exit.
    pub async fn terminate(&mut self) {
        if self.child.start_kill().is_ok() {
            self.killed = true;
            let _ = tokio::time::timeout(Duration::from_secs(2), self.child.wait()).await;
        }
        debug!(role = %self.role, pid = ?self.pid, "device process terminated");
    }

    /// Whether `terminate` was ever invoked on a live process.
    pub fn was_killed(&self) -> bool {
        self.killed
    }
}

/// Reader task: merge stdout/stderr, tee each line to the log file, keep a
/// bounded tail, and forward lines to the watcher channel.
async fn pump_output(
    stdout: tokio::process::ChildStdout,
    stderr: tokio::process::ChildStderr,
    mut log: tokio::fs::File,
    line_tx: mpsc::UnboundedSender<String>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        let line = tokio::select! {
            res = out_lines.next_line(), if !out_done => match res {
                Ok(Some(line)) => Some(line),
                _ => {
                    out_done = true;
                    None
                }
            },
            res = err_lines.next_line(), if !err_done => match res {
                Ok(Some(line)) => Some(line),
                _ => {
                    err_done = true;
                    None
                }
            },
        };

        if let Some(line) = line {
            let _ = log.write_all(line.as_bytes()).await;
            let _ = log.write_all(b"\n").await;
            let _ = log.flush().await;

            {
                let mut tail = tail.lock().expect("tail lock");
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.clone());
            }

            // Watcher may have resolved or never existed; both are fine.
            let _ = line_tx.send(line);
        }
    }
}

/// Wrap a device command for its transport.
fn transport_argv(cmd: Vec<String>, transport: &Transport) -> Vec<String> {
    match transport {
        Transport::Local => cmd,
        Transport::Remote {
            host,
            user,
            identity_file,
        } => {
            let mut argv = vec![
                "ssh".to_string(),
                "-o".to_string(),
                "StrictHostKeyChecking=no".to_string(),
            ];
            if let Some(identity) = identity_file {
                argv.push("-i".to_string());
                argv.push(identity.to_string_lossy().into_owned());
            }
            argv.push(format!("{user}@{host}"));
            argv.push(cmd.join(" "));
            argv
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceSpec;
    use std::path::PathBuf;

    fn sh(role: DeviceRole, script: &str) -> DeviceSpec {
        DeviceSpec::custom(
            role,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn launch_and_wait_success() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(DeviceRole::Rx1, "echo hello; echo oops >&2");
        let mut handle = ProcessHandle::launch(&spec, dir.path(), false).await.unwrap();

        assert_eq!(handle.wait(Duration::from_secs(5)).await, WaitOutcome::Exited(0));

        // Log tee runs regardless of watchers; give the reader a moment to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let log = std::fs::read_to_string(dir.path().join("rx1.log")).unwrap();
        assert!(log.contains("hello"));
        assert!(log.contains("oops"));
        assert!(handle.output_tail().contains("hello"));
    }

    #[tokio::test]
    async fn launch_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let spec = DeviceSpec::custom(
            DeviceRole::Rx1,
            vec!["definitely-not-a-real-binary-xyz".to_string()],
        );
        match ProcessHandle::launch(&spec, dir.path(), false).await {
            Err(LaunchError::ProgramNotFound { program }) => {
                assert!(program.contains("definitely-not"));
            }
            other => panic!("expected ProgramNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn wait_times_out_on_long_process() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(DeviceRole::Rx2, "sleep 30");
        let mut handle = ProcessHandle::launch(&spec, dir.path(), false).await.unwrap();
        assert_eq!(handle.wait(Duration::from_millis(100)).await, WaitOutcome::TimedOut);
        handle.terminate().await;
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(DeviceRole::Tx, "sleep 30");
        let mut handle = ProcessHandle::launch(&spec, dir.path(), false).await.unwrap();

        handle.terminate().await;
        handle.terminate().await; // no-op, never panics
        assert!(handle.was_killed());

        match handle.wait(Duration::from_secs(2)).await {
            WaitOutcome::Exited(_) => {}
            WaitOutcome::TimedOut => panic!("terminated process should be reaped"),
        }
    }

    #[tokio::test]
    async fn terminate_after_natural_exit_is_safe() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(DeviceRole::Rx1, "true");
        let mut handle = ProcessHandle::launch(&spec, dir.path(), false).await.unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)).await, WaitOutcome::Exited(0));
        handle.terminate().await;
        handle.terminate().await;
    }

    #[tokio::test]
    async fn take_lines_is_take_once() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(DeviceRole::Rx1, "echo armed");
        let mut handle = ProcessHandle::launch(&spec, dir.path(), false).await.unwrap();
        assert!(handle.take_lines().is_some());
        assert!(handle.take_lines().is_none());
        handle.wait(Duration::from_secs(5)).await;
    }

    #[test]
    fn remote_transport_wraps_in_ssh() {
        let argv = transport_argv(
            vec!["hackrf_transfer".to_string(), "-r".to_string(), "out.iq".to_string()],
            &Transport::Remote {
                host: "10.0.0.5".to_string(),
                user: "pi1".to_string(),
                identity_file: Some(PathBuf::from("/keys/id")),
            },
        );
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-i".to_string()));
        assert!(argv.contains(&"pi1@10.0.0.5".to_string()));
        assert_eq!(argv.last().unwrap(), "hackrf_transfer -r out.iq");
    }

    #[test]
    fn device_exit_success_sentinel() {
        assert!(DeviceExit::Code { code: 0 }.is_success());
        assert!(!DeviceExit::Code { code: 3 }.is_success());
        assert!(!DeviceExit::FailedToLaunch.is_success());
        assert!(!DeviceExit::KilledOnTimeout.is_success());
    }
}
