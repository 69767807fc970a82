//! Session configuration snapshot.
//!
//! Every user-managed knob for a collection session, serialized verbatim
//! into `session.json` and each per-run document so a run can be replayed
//! from its own records.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::device::Tuning;
use crate::readiness::DEFAULT_READY_PATTERNS;

/// All user-managed knobs for one collection session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Number of runs in the session.
    pub runs: u32,
    /// Root directory for session output.
    pub data_root: PathBuf,
    /// Optional label appended to the session directory name.
    pub tag: String,
    /// RF tuning shared by all devices unless a spec overrides it.
    pub tuning: Tuning,
    /// TX waveform file replayed at trigger time.
    pub pulse_path: PathBuf,
    /// Readiness marker patterns scanned against receiver output.
    pub ready_patterns: Vec<String>,
    /// How long each receiver gets to signal readiness.
    pub ready_timeout_ms: u64,
    /// How long to wait for each device to exit after the capture window.
    pub tx_wait_timeout_ms: u64,
    /// Extra wait beyond the computed capture duration.
    pub safety_margin_ms: u64,
    /// Use the hardware trigger line; readiness then logs but does not gate.
    pub hw_trigger: bool,
    /// Abort the session after the first run that is not Ok.
    pub fail_fast: bool,
    /// Command used to probe attached devices before the first run.
    /// None skips the preflight check.
    pub probe_command: Option<Vec<String>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runs: 1,
            data_root: PathBuf::from("Data"),
            tag: String::new(),
            tuning: Tuning::default(),
            pulse_path: PathBuf::from("pilot.iq"),
            ready_patterns: DEFAULT_READY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            ready_timeout_ms: 500,
            tx_wait_timeout_ms: 10_000,
            safety_margin_ms: 1_000,
            hw_trigger: true,
            fail_fast: false,
            probe_command: Some(vec!["hackrf_info".to_string()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_field_settings() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.runs, 1);
        assert_eq!(cfg.tuning.freq_hz, 520_000_000);
        assert_eq!(cfg.tuning.sample_rate_hz, 20_000_000);
        assert_eq!(cfg.ready_timeout_ms, 500);
        assert_eq!(cfg.tx_wait_timeout_ms, 10_000);
        assert_eq!(cfg.safety_margin_ms, 1_000);
        assert!(cfg.hw_trigger);
        assert!(!cfg.fail_fast);
        assert!(!cfg.ready_patterns.is_empty());
    }

    #[test]
    fn config_serde_roundtrip() {
        let cfg = SessionConfig {
            runs: 12,
            tag: "bench".to_string(),
            fail_fast: true,
            ..SessionConfig::default()
        };
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: SessionConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, back);
    }
}
