//! Post-run artifact retrieval from remote capture hosts.
//!
//! Remote receivers write their captures to a path on their own host; this
//! stage copies them into the run directory with `scp` after the run
//! settles. Retrieval failure never fails the run outright: the outcome is
//! annotated and an otherwise-Ok run is downgraded to a partial failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{info, warn};

use crate::artifact::ArtifactRef;
use crate::coordinator::{CoordinatorOutcome, RunStatus};
use crate::device::{DeviceSpec, Transport};

/// Each remote artifact gets one retry on a failed copy.
const RETRIEVAL_ATTEMPTS: u32 = 2;

const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Copies remote capture files into the run directory after a run.
pub struct RetrievalStage {
    attempt_timeout: Duration,
}

impl Default for RetrievalStage {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

impl RetrievalStage {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_attempt_timeout(attempt_timeout: Duration) -> Self {
        Self { attempt_timeout }
    }

    /// Fetch every remote receiver's capture into `run_dir`, patching the
    /// matching device outcomes in place.
    pub async fn run(&self, devices: &[DeviceSpec], outcome: &mut CoordinatorOutcome, run_dir: &Path) {
        for spec in devices.iter().filter(|d| {
            d.enabled && d.role.is_receiver() && d.transport.is_remote()
        }) {
            let Some(device_outcome) = outcome
                .device_outcomes
                .iter_mut()
                .find(|o| o.role == spec.role)
            else {
                continue;
            };
            match self.fetch(spec, run_dir).await {
                Ok(local) => {
                    info!(role = %spec.role, path = %local.display(), "remote capture retrieved");
                    device_outcome.artifacts = vec![ArtifactRef::capture(&local)];
                }
                Err(err) => {
                    warn!(role = %spec.role, error = %err, "remote capture retrieval failed");
                    device_outcome.retrieval_error = Some(err);
                    if outcome.status == RunStatus::Ok {
                        outcome.status = RunStatus::PartialFailure;
                    }
                }
            }
        }
    }

    async fn fetch(&self, spec: &DeviceSpec, run_dir: &Path) -> Result<PathBuf, String> {
        let Transport::Remote {
            host,
            user,
            identity_file,
        } = &spec.transport
        else {
            return Err("device is not remote".to_string());
        };
        let remote = spec
            .remote_outfile
            .as_ref()
            .ok_or_else(|| "remote receiver has no remote_outfile".to_string())?;
        let name = spec
            .output_name
            .as_deref()
            .ok_or_else(|| "remote receiver has no output name".to_string())?;
        let local = run_dir.join(name);

        let mut last_err = String::new();
        for attempt in 1..=RETRIEVAL_ATTEMPTS {
            match scp(user, host, identity_file.as_deref(), remote, &local, self.attempt_timeout).await {
                Ok(()) => return Ok(local),
                Err(err) => {
                    warn!(role = %spec.role, attempt, error = %err, "scp attempt failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

async fn scp(
    user: &str,
    host: &str,
    identity_file: Option<&Path>,
    remote: &Path,
    local: &Path,
    timeout: Duration,
) -> Result<(), String> {
    let mut cmd = Command::new("scp");
    cmd.arg("-o").arg("StrictHostKeyChecking=no");
    if let Some(identity) = identity_file {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(format!("{user}@{host}:{}", remote.display()));
    cmd.arg(local);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                Err(format!("scp exited with {}", output.status))
            } else {
                Err(stderr.to_string())
            }
        }
        Ok(Err(err)) => Err(format!("failed to run scp: {err}")),
        Err(_) => Err("scp timed out".to_string()),
    }
}
