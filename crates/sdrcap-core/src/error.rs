//! Error taxonomy for capture orchestration.
//!
//! Per-device failures (launch, readiness, capture timeout, retrieval) are
//! captured into device outcomes and run records rather than propagated; the
//! enums here cover the cases that are genuine `Err` values at a boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A device process or its transport could not be started.
///
/// Fatal to the run it belongs to, never to the session.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("device program not found: {program}")]
    ProgramNotFound { program: String },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device command is empty")]
    EmptyCommand,

    #[error("cannot open device log {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A run plan is malformed before anything is launched.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("duplicate device role in run plan: {0}")]
    DuplicateRole(String),

    #[error("invalid readiness pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors from the session ledger's durable storage.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("session document missing: {0}")]
    SessionMissing(PathBuf),

    #[error("run index out of sequence: expected run {expected}, found {found}")]
    IndexGap { expected: u32, found: u32 },

    #[error("failure count mismatch: session records {recorded}, index derives {derived}")]
    FailureCountMismatch { recorded: u32, derived: u32 },
}

/// Session-level errors raised before or between runs.
///
/// Once a run is in flight, its failures land in the run record instead.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("invalid run plan: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Why a run ended in `Failure`. Recorded on the run record, never thrown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A required receiver's process or transport could not be started.
    ReceiverLaunchFailed,
    /// A required receiver never signaled readiness within its timeout.
    ReceiverNotReady,
    /// The transmitter failed to fire.
    TransmitterFailed,
    /// The run was cancelled from outside while in flight.
    Aborted,
    /// The run directory could not be created.
    RunDirUnavailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_display() {
        let err = LaunchError::ProgramNotFound {
            program: "hackrf_transfer".to_string(),
        };
        assert!(err.to_string().contains("hackrf_transfer"));
    }

    #[test]
    fn ledger_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = LedgerError::from(io);
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn failure_reason_serde() {
        let reasons = [
            FailureReason::ReceiverLaunchFailed,
            FailureReason::ReceiverNotReady,
            FailureReason::TransmitterFailed,
            FailureReason::Aborted,
        ];
        for reason in &reasons {
            let json = serde_json::to_string(reason).expect("serialize");
            let back: FailureReason = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(*reason, back);
        }
        assert_eq!(
            serde_json::to_string(&FailureReason::ReceiverNotReady).unwrap(),
            "\"receiver_not_ready\""
        );
    }
}
