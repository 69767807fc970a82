//! Trigger coordination: the arm / ready / fire / collect state machine
//! for one run.
//!
//! Phase order is `Idle → Arming → AwaitingReady → Triggering →
//! AwaitingCapture → Collecting → {Completed, Failed}`. The transmitter
//! never fires before every required receiver has resolved readiness (or
//! hardware triggering makes the gate moot), and no run ends with orphaned
//! device processes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::artifact::ArtifactRef;
use crate::config::SessionConfig;
use crate::device::{DeviceRole, DeviceSpec};
use crate::error::{FailureReason, PlanError};
use crate::process::{DeviceExit, ProcessHandle, WaitOutcome};
use crate::readiness::{ReadinessEvent, ReadinessWatcher};

/// Grace period applied when waiting out a process we just terminated.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Phases of one run's lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Arming,
    AwaitingReady,
    Triggering,
    AwaitingCapture,
    Collecting,
    Completed,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Arming => "arming",
            RunPhase::AwaitingReady => "awaiting_ready",
            RunPhase::Triggering => "triggering",
            RunPhase::AwaitingCapture => "awaiting_capture",
            RunPhase::Collecting => "collecting",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// How the trigger was delivered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMethod {
    Hardware,
    Software,
}

/// Record of the single trigger firing in a run. A run that fails
/// readiness never produces one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerOutcome {
    pub fired_at: DateTime<Utc>,
    pub method: TriggerMethod,
    /// Longest any required receiver took to become ready.
    pub waited_for_ready_ms: u64,
}

/// Per-device result of one run; produced even on launch failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceOutcome {
    pub role: DeviceRole,
    pub exit: DeviceExit,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub artifacts: Vec<ArtifactRef>,
    pub stderr_tail: String,
    /// Non-fatal artifact retrieval failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_error: Option<String>,
}

impl DeviceOutcome {
    fn failed_to_launch(role: DeviceRole, error: String) -> Self {
        let now = Utc::now();
        Self {
            role,
            exit: DeviceExit::FailedToLaunch,
            started_at: now,
            ended_at: now,
            artifacts: Vec::new(),
            stderr_tail: error,
            retrieval_error: None,
        }
    }
}

/// Overall status of one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    PartialFailure,
    Failure,
}

/// Cancellation signal shared between a session driver and the in-flight
/// run. Triggering it makes the coordinator terminate every live device
/// process before the run is recorded.
#[derive(Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
    flag: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has been triggered.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Validated set of device specs and timing knobs for one run.
#[derive(Debug)]
pub struct RunPlan {
    devices: Vec<DeviceSpec>,
    compiled_patterns: Vec<(Regex, String)>,
    pub ready_timeout: Duration,
    pub tx_wait_timeout: Duration,
    pub safety_margin_ms: u64,
    pub hw_trigger: bool,
}

impl RunPlan {
    /// Build a plan, rejecting duplicate roles and bad patterns up front.
    pub fn new(
        devices: Vec<DeviceSpec>,
        ready_patterns: &[String],
        ready_timeout: Duration,
        tx_wait_timeout: Duration,
        safety_margin_ms: u64,
        hw_trigger: bool,
    ) -> Result<Self, PlanError> {
        let mut seen = Vec::new();
        for spec in &devices {
            if seen.contains(&spec.role) {
                return Err(PlanError::DuplicateRole(spec.role.name().to_string()));
            }
            seen.push(spec.role);
        }

        let compiled_patterns = ready_patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .map(|re| (re, p.clone()))
                    .map_err(|source| PlanError::Pattern {
                        pattern: p.clone(),
                        source,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            devices,
            compiled_patterns,
            ready_timeout,
            tx_wait_timeout,
            safety_margin_ms,
            hw_trigger,
        })
    }

    pub fn from_config(config: &SessionConfig, devices: Vec<DeviceSpec>) -> Result<Self, PlanError> {
        Self::new(
            devices,
            &config.ready_patterns,
            Duration::from_millis(config.ready_timeout_ms),
            Duration::from_millis(config.tx_wait_timeout_ms),
            config.safety_margin_ms,
            config.hw_trigger,
        )
    }

    pub fn devices(&self) -> &[DeviceSpec] {
        &self.devices
    }

    /// Enabled receivers, in plan order.
    pub fn receivers(&self) -> impl Iterator<Item = &DeviceSpec> {
        self.devices.iter().filter(|d| d.enabled && d.role.is_receiver())
    }

    /// The enabled transmitter, if this plan transmits at all.
    pub fn transmitter(&self) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.enabled && d.role == DeviceRole::Tx)
    }

    fn watcher(&self, role: DeviceRole) -> ReadinessWatcher {
        ReadinessWatcher::from_compiled(role, self.compiled_patterns.clone())
    }

    /// Capture wait covering the longest enabled receiver, plus margin.
    pub fn capture_wait_ms(&self) -> u64 {
        self.receivers()
            .map(|r| capture_wait_ms(r.tuning.num_samples, r.tuning.sample_rate_hz, self.safety_margin_ms))
            .max()
            .unwrap_or(self.safety_margin_ms)
    }
}

/// Milliseconds to wait for a fixed-size capture to complete, rounded up,
/// plus the safety margin. Covers receiver-side buffering latency for any
/// fixed sample count.
pub fn capture_wait_ms(num_samples: u64, sample_rate_hz: u64, safety_margin_ms: u64) -> u64 {
    if sample_rate_hz == 0 {
        return safety_margin_ms;
    }
    let capture_ms = num_samples.saturating_mul(1000).div_ceil(sample_rate_hz);
    capture_ms + safety_margin_ms
}

/// Everything one coordinator lifecycle resolves to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorOutcome {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_outcome: Option<TriggerOutcome>,
    pub readiness_events: Vec<ReadinessEvent>,
    pub device_outcomes: Vec<DeviceOutcome>,
}

/// Drives one run through the phase machine.
pub struct TriggerCoordinator<'p> {
    plan: &'p RunPlan,
    run_dir: PathBuf,
    phase: RunPhase,
}

impl<'p> TriggerCoordinator<'p> {
    pub fn new(plan: &'p RunPlan, run_dir: PathBuf) -> Self {
        Self {
            plan,
            run_dir,
            phase: RunPhase::Idle,
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
        crate::obs::emit_phase(phase);
    }

    /// Run the full lifecycle. Never returns an error: every failure mode
    /// is folded into the outcome.
    pub async fn execute(mut self, abort: &AbortSignal) -> CoordinatorOutcome {
        // ---- Arming: launch every enabled receiver concurrently ----
        self.set_phase(RunPhase::Arming);
        let receivers: Vec<&DeviceSpec> = self.plan.receivers().collect();
        let launches = futures::future::join_all(
            receivers
                .iter()
                .map(|spec| ProcessHandle::launch(spec, &self.run_dir, self.plan.hw_trigger)),
        )
        .await;

        let mut live: Vec<(&DeviceSpec, ProcessHandle)> = Vec::new();
        let mut device_outcomes: Vec<DeviceOutcome> = Vec::new();
        let mut launch_failed = false;
        for (spec, launched) in receivers.into_iter().zip(launches) {
            match launched {
                Ok(handle) => live.push((spec, handle)),
                Err(err) => {
                    warn!(role = %spec.role, error = %err, "receiver failed to launch");
                    device_outcomes.push(DeviceOutcome::failed_to_launch(spec.role, err.to_string()));
                    launch_failed = true;
                }
            }
        }
        if launch_failed {
            return self
                .fail(FailureReason::ReceiverLaunchFailed, live, device_outcomes, Vec::new())
                .await;
        }
        if abort.is_triggered() {
            return self.fail(FailureReason::Aborted, live, device_outcomes, Vec::new()).await;
        }

        // ---- AwaitingReady: one watcher per receiver, own clocks ----
        self.set_phase(RunPhase::AwaitingReady);
        let mut watches = Vec::new();
        for (spec, handle) in live.iter_mut() {
            if let Some(lines) = handle.take_lines() {
                let watcher = self.plan.watcher(spec.role);
                watches.push(watcher.watch(lines, handle.launched_instant(), self.plan.ready_timeout));
            }
        }

        let readiness_events: Vec<ReadinessEvent> = if self.plan.hw_trigger {
            // The hardware trigger line performs the synchronization;
            // watchers still run for the logs but do not gate.
            for watch in watches {
                tokio::spawn(async move {
                    let event = watch.await;
                    info!(
                        role = %event.role,
                        ready = event.is_ready(),
                        matched = ?event.matched_pattern,
                        waited_ms = event.waited_ms,
                        "readiness (hardware trigger, not gating)"
                    );
                });
            }
            Vec::new()
        } else {
            let gathered = tokio::select! {
                events = futures::future::join_all(watches) => events,
                _ = abort.wait() => {
                    return self.fail(FailureReason::Aborted, live, device_outcomes, Vec::new()).await;
                }
            };
            for event in &gathered {
                info!(
                    role = %event.role,
                    ready = event.is_ready(),
                    matched = ?event.matched_pattern,
                    waited_ms = event.waited_ms,
                    "readiness resolved"
                );
            }
            if gathered.iter().any(|e| !e.is_ready()) {
                let stragglers: Vec<&str> =
                    gathered.iter().filter(|e| !e.is_ready()).map(|e| e.role.name()).collect();
                warn!(not_ready = ?stragglers, "receivers never signaled ready; aborting run");
                return self
                    .fail(FailureReason::ReceiverNotReady, live, device_outcomes, gathered)
                    .await;
            }
            gathered
        };

        // ---- Triggering: fire the transmitter exactly once ----
        self.set_phase(RunPhase::Triggering);
        let method = if self.plan.hw_trigger {
            TriggerMethod::Hardware
        } else {
            TriggerMethod::Software
        };
        let waited_for_ready_ms = readiness_events.iter().map(|e| e.waited_ms).max().unwrap_or(0);

        let mut trigger_outcome = None;
        let mut transmitter_failed = false;
        if let Some(tx_spec) = self.plan.transmitter() {
            match ProcessHandle::launch(tx_spec, &self.run_dir, false).await {
                Ok(handle) => {
                    trigger_outcome = Some(TriggerOutcome {
                        fired_at: Utc::now(),
                        method,
                        waited_for_ready_ms,
                    });
                    crate::obs::emit_trigger_fired(method, waited_for_ready_ms);
                    live.push((tx_spec, handle));
                }
                Err(err) => {
                    warn!(error = %err, "transmitter failed to fire");
                    device_outcomes.push(DeviceOutcome::failed_to_launch(DeviceRole::Tx, err.to_string()));
                    transmitter_failed = true;
                }
            }
        }

        // ---- AwaitingCapture: cover the fixed-size capture window ----
        self.set_phase(RunPhase::AwaitingCapture);
        let wait_ms = self.plan.capture_wait_ms();
        debug!(wait_ms, "waiting for captures to complete");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            _ = abort.wait() => {
                return self.fail(FailureReason::Aborted, live, device_outcomes, readiness_events).await;
            }
        }

        // ---- Collecting: reap every device, forcibly if needed ----
        self.set_phase(RunPhase::Collecting);
        let mut aborted = false;
        for (spec, mut handle) in live.drain(..) {
            let waited = if aborted {
                None
            } else {
                let wait = handle.wait(self.plan.tx_wait_timeout);
                tokio::pin!(wait);
                tokio::select! {
                    res = &mut wait => Some(res),
                    _ = abort.wait() => None,
                }
            };
            let exit = match waited {
                Some(WaitOutcome::Exited(code)) => DeviceExit::Code { code },
                Some(WaitOutcome::TimedOut) => {
                    warn!(role = %handle.role(), "device still running after capture wait; terminating");
                    handle.terminate().await;
                    DeviceExit::KilledOnTimeout
                }
                None => {
                    aborted = true;
                    handle.terminate().await;
                    match handle.wait(TERMINATE_GRACE).await {
                        WaitOutcome::Exited(code) => DeviceExit::Code { code },
                        WaitOutcome::TimedOut => DeviceExit::KilledOnTimeout,
                    }
                }
            };
            device_outcomes.push(finish_outcome(spec, &handle, &self.run_dir, exit));
        }
        if aborted {
            self.set_phase(RunPhase::Failed);
            return CoordinatorOutcome {
                status: RunStatus::Failure,
                failure_reason: Some(FailureReason::Aborted),
                trigger_outcome,
                readiness_events,
                device_outcomes,
            };
        }

        let tx_required = self.plan.transmitter().is_some();
        let (status, failure_reason) = if transmitter_failed || (tx_required && trigger_outcome.is_none()) {
            (RunStatus::Failure, Some(FailureReason::TransmitterFailed))
        } else if device_outcomes.iter().all(|o| o.exit.is_success()) {
            (RunStatus::Ok, None)
        } else {
            (RunStatus::PartialFailure, None)
        };

        self.set_phase(match status {
            RunStatus::Failure => RunPhase::Failed,
            _ => RunPhase::Completed,
        });

        CoordinatorOutcome {
            status,
            failure_reason,
            trigger_outcome,
            readiness_events,
            device_outcomes,
        }
    }

    /// Terminate everything still live and fold the wreckage into a
    /// `Failure` outcome.
    async fn fail(
        &mut self,
        reason: FailureReason,
        live: Vec<(&DeviceSpec, ProcessHandle)>,
        mut device_outcomes: Vec<DeviceOutcome>,
        readiness_events: Vec<ReadinessEvent>,
    ) -> CoordinatorOutcome {
        for (spec, mut handle) in live {
            handle.terminate().await;
            let exit = match handle.wait(TERMINATE_GRACE).await {
                WaitOutcome::Exited(code) => DeviceExit::Code { code },
                WaitOutcome::TimedOut => DeviceExit::KilledOnTimeout,
            };
            device_outcomes.push(finish_outcome(spec, &handle, &self.run_dir, exit));
        }
        self.set_phase(RunPhase::Failed);
        CoordinatorOutcome {
            status: RunStatus::Failure,
            failure_reason: Some(reason),
            trigger_outcome: None,
            readiness_events,
            device_outcomes,
        }
    }
}

/// Build the outcome for an already-reaped device.
fn finish_outcome(spec: &DeviceSpec, handle: &ProcessHandle, run_dir: &Path, exit: DeviceExit) -> DeviceOutcome {
    let artifacts = spec
        .expected_artifacts(run_dir)
        .into_iter()
        .map(|path| {
            if spec.transport.is_remote() {
                ArtifactRef::unresolved(path)
            } else {
                ArtifactRef::capture(&path)
            }
        })
        .collect();

    DeviceOutcome {
        role: handle.role(),
        exit,
        started_at: handle.launched_at(),
        ended_at: Utc::now(),
        artifacts,
        stderr_tail: handle.output_tail(),
        retrieval_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Transport, Tuning};

    #[test]
    fn capture_wait_exact_second_plus_margin() {
        // 20M samples at 20 MHz is exactly one second of capture.
        assert_eq!(capture_wait_ms(20_000_000, 20_000_000, 1_000), 2_000);
    }

    #[test]
    fn capture_wait_rounds_up() {
        // 1 sample at 1 MHz is 1 microsecond; wait must round up to 1 ms.
        assert_eq!(capture_wait_ms(1, 1_000_000, 0), 1);
        assert_eq!(capture_wait_ms(0, 1_000_000, 50), 50);
    }

    #[test]
    fn capture_wait_zero_rate_degenerates_to_margin() {
        assert_eq!(capture_wait_ms(7_000, 0, 250), 250);
    }

    #[test]
    fn plan_rejects_duplicate_roles() {
        let devices = vec![
            DeviceSpec::receiver(DeviceRole::Rx1, Transport::Local, None, Tuning::default()),
            DeviceSpec::receiver(DeviceRole::Rx1, Transport::Local, None, Tuning::default()),
        ];
        let err = RunPlan::new(devices, &[], Duration::from_secs(1), Duration::from_secs(1), 0, false)
            .unwrap_err();
        assert!(err.to_string().contains("rx1"));
    }

    #[test]
    fn plan_rejects_bad_pattern() {
        let devices = vec![DeviceSpec::receiver(
            DeviceRole::Rx1,
            Transport::Local,
            None,
            Tuning::default(),
        )];
        let err = RunPlan::new(
            devices,
            &["(bad".to_string()],
            Duration::from_secs(1),
            Duration::from_secs(1),
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::Pattern { .. }));
    }

    #[test]
    fn disabled_devices_are_excluded_from_plan_views() {
        let devices = vec![
            DeviceSpec::receiver(DeviceRole::Rx1, Transport::Local, None, Tuning::default()),
            DeviceSpec::receiver(DeviceRole::Rx2, Transport::Local, None, Tuning::default()).disabled(),
            DeviceSpec::transmitter(Transport::Local, None, Tuning::default(), "pilot.iq".into()).disabled(),
        ];
        let plan =
            RunPlan::new(devices, &[], Duration::from_secs(1), Duration::from_secs(1), 0, false).unwrap();
        assert_eq!(plan.receivers().count(), 1);
        assert!(plan.transmitter().is_none());
    }

    #[test]
    fn plan_capture_wait_uses_longest_receiver() {
        let mut slow = Tuning::default();
        slow.num_samples = 40_000_000;
        slow.sample_rate_hz = 20_000_000;
        let mut fast = Tuning::default();
        fast.num_samples = 1_000;
        fast.sample_rate_hz = 1_000_000;
        let devices = vec![
            DeviceSpec::receiver(DeviceRole::Rx1, Transport::Local, None, fast),
            DeviceSpec::receiver(DeviceRole::Rx2, Transport::Local, None, slow),
        ];
        let plan =
            RunPlan::new(devices, &[], Duration::from_secs(1), Duration::from_secs(1), 500, false).unwrap();
        assert_eq!(plan.capture_wait_ms(), 2_500);
    }

    #[tokio::test]
    async fn abort_signal_wakes_waiters() {
        let abort = AbortSignal::new();
        let waiter = abort.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        assert!(!abort.is_triggered());
        abort.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(abort.is_triggered());
    }

    #[tokio::test]
    async fn abort_wait_returns_immediately_when_already_triggered() {
        let abort = AbortSignal::new();
        abort.trigger();
        tokio::time::timeout(Duration::from_millis(100), abort.wait())
            .await
            .expect("already-triggered wait must not block");
    }
}
