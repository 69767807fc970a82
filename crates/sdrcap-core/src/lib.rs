//! sdrcap core library
//!
//! Orchestrates synchronized RF captures across multiple software-defined
//! radios: arms the receivers, waits for their readiness markers, fires the
//! transmitter exactly once, waits out the capture window, and records
//! every run in an append-only session ledger.

pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod ledger;
pub mod obs;
pub mod process;
pub mod readiness;
pub mod retrieval;
pub mod session;
pub mod telemetry;

pub use artifact::{ArtifactRef, DIGEST_SIZE_CAP};
pub use config::SessionConfig;
pub use coordinator::{
    capture_wait_ms, AbortSignal, CoordinatorOutcome, DeviceOutcome, RunPhase, RunPlan, RunStatus,
    TriggerCoordinator, TriggerMethod, TriggerOutcome,
};
pub use device::{DeviceRole, DeviceSpec, Transport, Tuning, DEFAULT_DEVICE_PROGRAM};
pub use error::{FailureReason, LaunchError, LedgerError, PlanError, SessionError};
pub use ledger::{IndexEntry, RunRecord, SessionLedger, SessionRecord};
pub use obs::run_span;
pub use process::{DeviceExit, ProcessHandle, WaitOutcome};
pub use readiness::{ReadinessEvent, ReadinessWatcher, DEFAULT_READY_PATTERNS};
pub use retrieval::RetrievalStage;
pub use session::{preflight, run_session, session_dir_name, RunSession, SessionSummary};
pub use telemetry::init_tracing;

/// sdrcap version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
