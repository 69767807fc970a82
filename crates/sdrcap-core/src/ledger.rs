//! Append-only session ledger.
//!
//! One session directory holds three kinds of document:
//!
//! - `session.json` — the session record, rewritten atomically after every
//!   run (temp file + rename, never truncate-in-place);
//! - `index.jsonl` — one line per completed run, append-only, flushed and
//!   synced before the session record is updated;
//! - `run_NNNN/run.json` — the full per-run record inside its run directory.
//!
//! Run ids are 1-based and gapless; the ledger refuses an out-of-sequence
//! append and flags a corrupt index at load time.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::SessionConfig;
use crate::coordinator::{DeviceOutcome, RunStatus, TriggerOutcome};
use crate::device::DeviceSpec;
use crate::error::{FailureReason, LedgerError};
use crate::readiness::ReadinessEvent;

const SESSION_FILE: &str = "session.json";
const INDEX_FILE: &str = "index.jsonl";
const RUN_FILE: &str = "run.json";

/// Top-level session document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    /// Session directory name; unique per session.
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub planned_runs: u32,
    /// Device specs snapshotted at session start.
    pub device_specs: Vec<DeviceSpec>,
    /// Full configuration snapshot; a run is replayable from this alone.
    pub config: SessionConfig,
    pub runs_completed: u32,
    /// Runs whose status was not Ok.
    pub failure_count: u32,
}

impl SessionRecord {
    pub fn new(
        session_id: String,
        planned_runs: u32,
        device_specs: Vec<DeviceSpec>,
        config: SessionConfig,
    ) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            planned_runs,
            device_specs,
            config,
            runs_completed: 0,
            failure_count: 0,
        }
    }
}

/// Everything recorded about one run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// 1-based, gapless within the session.
    pub run_id: u32,
    pub run_dir: PathBuf,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_outcome: Option<TriggerOutcome>,
    pub device_outcomes: Vec<DeviceOutcome>,
    pub readiness_events: Vec<ReadinessEvent>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// One line of `index.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub run_id: u32,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    pub ended_at: DateTime<Utc>,
}

/// Owns the session directory's documents.
#[derive(Debug)]
pub struct SessionLedger {
    root: PathBuf,
    record: SessionRecord,
    /// Status of the most recently appended run, if any.
    last_status: Option<RunStatus>,
}

impl SessionLedger {
    /// Create the session directory and its initial `session.json`.
    pub fn create(root: PathBuf, record: SessionRecord) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(&root)?;
        let ledger = Self {
            root,
            record,
            last_status: None,
        };
        ledger.write_session()?;
        info!(session = %ledger.record.session_id, path = %ledger.root.display(), "session ledger created");
        Ok(ledger)
    }

    /// Reopen an existing session directory, verifying internal consistency.
    pub fn load(root: PathBuf) -> Result<Self, LedgerError> {
        let session_path = root.join(SESSION_FILE);
        if !session_path.exists() {
            return Err(LedgerError::SessionMissing(session_path));
        }
        let record: SessionRecord = serde_json::from_str(&std::fs::read_to_string(&session_path)?)?;

        let entries = read_index(&root)?;
        for (i, entry) in entries.iter().enumerate() {
            let expected = i as u32 + 1;
            if entry.run_id != expected {
                return Err(LedgerError::IndexGap {
                    expected,
                    found: entry.run_id,
                });
            }
        }
        if entries.len() as u32 != record.runs_completed {
            return Err(LedgerError::IndexGap {
                expected: record.runs_completed,
                found: entries.len() as u32,
            });
        }
        let derived = entries.iter().filter(|e| e.status != RunStatus::Ok).count() as u32;
        if derived != record.failure_count {
            return Err(LedgerError::FailureCountMismatch {
                recorded: record.failure_count,
                derived,
            });
        }

        let last_status = entries.last().map(|e| e.status);
        Ok(Self {
            root,
            record,
            last_status,
        })
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a given run id, `run_0001` style.
    pub fn run_dir(&self, run_id: u32) -> PathBuf {
        self.root.join(format!("run_{run_id:04}"))
    }

    /// Id the next appended run must carry.
    pub fn next_run_id(&self) -> u32 {
        self.record.runs_completed + 1
    }

    /// Append one completed run: `run.json`, then the index line, then the
    /// refreshed session record.
    pub fn append(&mut self, run: &RunRecord) -> Result<(), LedgerError> {
        let expected = self.next_run_id();
        if run.run_id != expected {
            return Err(LedgerError::IndexGap {
                expected,
                found: run.run_id,
            });
        }

        std::fs::create_dir_all(&run.run_dir)?;
        write_json_atomic(&run.run_dir.join(RUN_FILE), run)?;

        let entry = IndexEntry {
            run_id: run.run_id,
            status: run.status,
            failure_reason: run.failure_reason,
            ended_at: run.ended_at,
        };
        let mut index = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(INDEX_FILE))?;
        index.write_all(serde_json::to_string(&entry)?.as_bytes())?;
        index.write_all(b"\n")?;
        index.flush()?;
        index.sync_data()?;

        self.record.runs_completed += 1;
        if run.status != RunStatus::Ok {
            self.record.failure_count += 1;
        }
        self.last_status = Some(run.status);
        self.write_session()?;

        crate::obs::emit_run_recorded(run.run_id, run.status, self.record.failure_count);
        Ok(())
    }

    /// Whether a fail-fast session should stop before the next run: true
    /// iff fail-fast is set and the most recently appended run is not Ok.
    pub fn should_abort(&self, fail_fast: bool) -> bool {
        fail_fast && matches!(self.last_status, Some(status) if status != RunStatus::Ok)
    }

    /// Load the full record for one run.
    pub fn read_run(&self, run_id: u32) -> Result<RunRecord, LedgerError> {
        let path = self.run_dir(run_id).join(RUN_FILE);
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Index entries in append order.
    pub fn index(&self) -> Result<Vec<IndexEntry>, LedgerError> {
        read_index(&self.root)
    }

    fn write_session(&self) -> Result<(), LedgerError> {
        write_json_atomic(&self.root.join(SESSION_FILE), &self.record)
    }
}

fn read_index(root: &Path) -> Result<Vec<IndexEntry>, LedgerError> {
    let path = root.join(INDEX_FILE);
    if !path.exists() {
        return Ok(Vec::new());
    }
    std::fs::read_to_string(path)?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(LedgerError::from))
        .collect()
}

/// Write via a sibling temp file and rename; readers never observe a
/// truncated document.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| LedgerError::Io(e.error))?;
    Ok(())
}
