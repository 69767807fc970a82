//! Structured observability hooks for the session/run lifecycle.
//!
//! [`run_span`] scopes all tracing output to one run (instrument the run
//! future with it); the emit functions cover the lifecycle events a log
//! pipeline keys on.

use tracing::{info, Span};

use crate::coordinator::{RunPhase, RunStatus, TriggerMethod};

/// Span tagged with the session id and run id. Attach it to the run's
/// future with `tracing::Instrument` so every event inside carries both.
pub fn run_span(session_id: &str, run_id: u32) -> Span {
    tracing::info_span!("sdrcap.run", session = %session_id, run_id = run_id)
}

/// Emit event: session started.
pub fn emit_session_started(session_id: &str, planned_runs: u32) {
    info!(event = "session.started", session = %session_id, planned_runs = planned_runs);
}

/// Emit event: session finished.
pub fn emit_session_finished(session_id: &str, runs_completed: u32, failure_count: u32, aborted: bool) {
    info!(
        event = "session.finished",
        session = %session_id,
        runs_completed = runs_completed,
        failure_count = failure_count,
        aborted = aborted,
    );
}

/// Emit event: run phase transition.
pub fn emit_phase(phase: RunPhase) {
    info!(event = "run.phase", phase = %phase);
}

/// Emit event: the trigger fired.
pub fn emit_trigger_fired(method: TriggerMethod, waited_for_ready_ms: u64) {
    info!(
        event = "run.trigger_fired",
        method = ?method,
        waited_for_ready_ms = waited_for_ready_ms,
    );
}

/// Emit event: a run record was appended to the ledger.
pub fn emit_run_recorded(run_id: u32, status: RunStatus, failure_count: u32) {
    info!(
        event = "run.recorded",
        run_id = run_id,
        status = ?status,
        failure_count = failure_count,
    );
}
