//! Session orchestration: preflight, the per-run boundary, and the
//! multi-run driver.
//!
//! A session is N runs against one device set, recorded in one session
//! directory. Failures inside a run never escape the run boundary; they
//! become run records. Errors before the first run (bad plan, failed
//! preflight, unusable data root) abort the session up front.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn, Instrument};

use crate::config::SessionConfig;
use crate::coordinator::{AbortSignal, RunPlan, RunStatus, TriggerCoordinator};
use crate::device::DeviceSpec;
use crate::error::{FailureReason, SessionError};
use crate::ledger::{RunRecord, SessionLedger, SessionRecord};
use crate::retrieval::RetrievalStage;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// What a finished (or aborted) session amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub session_dir: PathBuf,
    pub runs_planned: u32,
    pub runs_completed: u32,
    pub failure_count: u32,
    pub aborted: bool,
}

impl SessionSummary {
    /// True when every planned run completed with status Ok.
    pub fn all_ok(&self) -> bool {
        !self.aborted && self.failure_count == 0 && self.runs_completed == self.runs_planned
    }
}

/// Session directory name: `collect_<stamp>[_tag]`, stamp unique to the
/// microsecond-derived suffix.
pub fn session_dir_name(now: DateTime<Utc>, tag: &str) -> String {
    let stamp = now.format("%Y-%m-%dT%H-%M-%S");
    let suffix = now.timestamp_subsec_micros() % 10_000;
    if tag.is_empty() {
        format!("collect_{stamp}-{suffix:04}")
    } else {
        format!("collect_{stamp}-{suffix:04}_{tag}")
    }
}

/// Probe for attached devices before the first run.
///
/// Runs the configured probe command once and requires every enabled local
/// device's serial to appear in its output. Remote devices are skipped;
/// their boards are attached to the remote host.
pub async fn preflight(config: &SessionConfig, devices: &[DeviceSpec]) -> Result<(), SessionError> {
    let Some(probe) = &config.probe_command else {
        debug!("no probe command configured; skipping preflight");
        return Ok(());
    };
    let (program, args) = probe
        .split_first()
        .ok_or_else(|| SessionError::Preflight("probe command is empty".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
    let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
        .await
        .map_err(|_| SessionError::Preflight(format!("probe command {program} timed out")))?
        .map_err(|e| SessionError::Preflight(format!("probe command {program} failed to run: {e}")))?;
    if !output.status.success() {
        return Err(SessionError::Preflight(format!(
            "probe command {program} exited with {}",
            output.status
        )));
    }

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    for spec in devices.iter().filter(|d| d.enabled && !d.transport.is_remote()) {
        if let Some(serial) = &spec.selector {
            if !text.contains(serial.as_str()) {
                return Err(SessionError::Preflight(format!(
                    "device {} (serial {serial}) not detected by probe",
                    spec.role
                )));
            }
            debug!(role = %spec.role, serial = %serial, "device detected");
        }
    }
    Ok(())
}

/// Executes single runs against a fixed plan.
pub struct RunSession<'p> {
    plan: &'p RunPlan,
    retrieval: RetrievalStage,
}

impl<'p> RunSession<'p> {
    pub fn new(plan: &'p RunPlan) -> Self {
        Self {
            plan,
            retrieval: RetrievalStage::new(),
        }
    }

    /// Execute one run end to end. Infallible by design: anything that
    /// goes wrong inside the run boundary is folded into the record.
    pub async fn execute(&self, run_id: u32, run_dir: &Path, abort: &AbortSignal) -> RunRecord {
        let started_at = Utc::now();
        info!(run_id, dir = %run_dir.display(), "run starting");

        if let Err(err) = std::fs::create_dir_all(run_dir) {
            warn!(run_id, error = %err, "run directory unavailable");
            return RunRecord {
                run_id,
                run_dir: run_dir.to_path_buf(),
                status: RunStatus::Failure,
                failure_reason: Some(FailureReason::RunDirUnavailable),
                trigger_outcome: None,
                device_outcomes: Vec::new(),
                readiness_events: Vec::new(),
                started_at,
                ended_at: Utc::now(),
            };
        }

        let coordinator = TriggerCoordinator::new(self.plan, run_dir.to_path_buf());
        let mut outcome = coordinator.execute(abort).await;
        self.retrieval
            .run(self.plan.devices(), &mut outcome, run_dir)
            .await;

        info!(run_id, status = ?outcome.status, "run finished");
        RunRecord {
            run_id,
            run_dir: run_dir.to_path_buf(),
            status: outcome.status,
            failure_reason: outcome.failure_reason,
            trigger_outcome: outcome.trigger_outcome,
            device_outcomes: outcome.device_outcomes,
            readiness_events: outcome.readiness_events,
            started_at,
            ended_at: Utc::now(),
        }
    }
}

/// Drive a whole session: validate, preflight, create the ledger, then
/// run and record until done, aborted, or stopped by fail-fast.
pub async fn run_session(
    config: SessionConfig,
    devices: Vec<DeviceSpec>,
    abort: AbortSignal,
) -> Result<SessionSummary, SessionError> {
    let plan = RunPlan::from_config(&config, devices.clone())?;
    preflight(&config, &devices).await?;

    let session_id = session_dir_name(Utc::now(), &config.tag);
    let root = config.data_root.join(&session_id);
    let planned_runs = config.runs;
    let record = SessionRecord::new(session_id.clone(), planned_runs, devices, config.clone());
    let mut ledger = SessionLedger::create(root.clone(), record)?;

    crate::obs::emit_session_started(&session_id, planned_runs);
    let session = RunSession::new(&plan);
    let mut aborted = false;
    while ledger.next_run_id() <= planned_runs {
        if abort.is_triggered() {
            warn!(session = %session_id, "session aborted before next run");
            aborted = true;
            break;
        }
        let run_id = ledger.next_run_id();
        let run_dir = ledger.run_dir(run_id);
        let run = session
            .execute(run_id, &run_dir, &abort)
            .instrument(crate::obs::run_span(&session_id, run_id))
            .await;
        let run_aborted = run.failure_reason == Some(FailureReason::Aborted);
        ledger.append(&run)?;
        if run_aborted {
            aborted = true;
            break;
        }
        if ledger.should_abort(config.fail_fast) {
            warn!(session = %session_id, run_id, "fail-fast stop after failed run");
            break;
        }
    }

    let summary = SessionSummary {
        session_dir: root,
        runs_planned: planned_runs,
        runs_completed: ledger.record().runs_completed,
        failure_count: ledger.record().failure_count,
        aborted,
    };
    crate::obs::emit_session_finished(
        &session_id,
        summary.runs_completed,
        summary.failure_count,
        summary.aborted,
    );
    Ok(summary)
}
