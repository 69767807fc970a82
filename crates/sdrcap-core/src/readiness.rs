//! Readiness detection over device output streams.
//!
//! Each device gets one watcher: a line-oriented scanner that resolves to a
//! single [`ReadinessEvent`], first pattern match wins. A timeout resolves
//! to a timed-out event, which is not an error by itself; escalation is the
//! coordinator's call.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::DeviceRole;
use crate::error::PlanError;

/// Marker patterns the stock capture tools print when armed and waiting
/// for a trigger.
pub const DEFAULT_READY_PATTERNS: &[&str] = &[
    "wait.*trigger",
    "waiting.*trigger",
    "trigger.*armed",
    "armed",
];

/// The single readiness resolution for one device in one run.
///
/// Produced at most once per device per run and never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessEvent {
    pub role: DeviceRole,
    pub observed_at: DateTime<Utc>,
    /// The pattern that matched; None for devices that assume readiness
    /// at launch (no patterns configured, or zero timeout).
    pub matched_pattern: Option<String>,
    pub timed_out: bool,
    /// Milliseconds between the device's own launch and resolution.
    pub waited_ms: u64,
}

impl ReadinessEvent {
    pub fn is_ready(&self) -> bool {
        !self.timed_out
    }

    fn ready(role: DeviceRole, matched_pattern: Option<String>, waited_ms: u64) -> Self {
        Self {
            role,
            observed_at: Utc::now(),
            matched_pattern,
            timed_out: false,
            waited_ms,
        }
    }

    fn timeout(role: DeviceRole, waited_ms: u64) -> Self {
        Self {
            role,
            observed_at: Utc::now(),
            matched_pattern: None,
            timed_out: true,
            waited_ms,
        }
    }
}

/// Scans one device's output lines for the first readiness marker.
#[derive(Debug)]
pub struct ReadinessWatcher {
    role: DeviceRole,
    patterns: Vec<(Regex, String)>,
}

impl ReadinessWatcher {
    /// Compile the pattern set. Patterns match case-insensitively.
    pub fn new(role: DeviceRole, patterns: &[String]) -> Result<Self, PlanError> {
        let compiled = patterns
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
            role,
            patterns: compiled,
        })
    }

    /// Build a watcher from an already-compiled pattern set.
    pub(crate) fn from_compiled(role: DeviceRole, patterns: Vec<(Regex, String)>) -> Self {
        Self { role, patterns }
    }

    /// Consume lines until a pattern matches or the deadline passes.
    ///
    /// The deadline is anchored at the device's own launch instant; clock
    /// skew between devices is not compensated. An empty pattern set
    /// resolves immediately ("assume ready at launch"). A closed stream
    /// (device exited before any match) resolves as timed out without
    /// waiting out the deadline.
    pub async fn watch(
        self,
        mut lines: mpsc::UnboundedReceiver<String>,
        launched: tokio::time::Instant,
        timeout: std::time::Duration,
    ) -> ReadinessEvent {
        if self.patterns.is_empty() || timeout.is_zero() {
            debug!(role = %self.role, "no readiness gating configured; ready at launch");
            return ReadinessEvent::ready(self.role, None, 0);
        }

        let deadline = launched + timeout;
        loop {
            match tokio::time::timeout_at(deadline, lines.recv()).await {
                Ok(Some(line)) => {
                    if let Some((_, pattern)) = self.patterns.iter().find(|(re, _)| re.is_match(&line)) {
                        let waited_ms = launched.elapsed().as_millis() as u64;
                        debug!(role = %self.role, pattern = %pattern, waited_ms, "readiness marker observed");
                        return ReadinessEvent::ready(self.role, Some(pattern.clone()), waited_ms);
                    }
                }
                Ok(None) => {
                    let waited_ms = launched.elapsed().as_millis() as u64;
                    debug!(role = %self.role, waited_ms, "output stream closed before readiness marker");
                    return ReadinessEvent::timeout(self.role, waited_ms);
                }
                Err(_) => {
                    let waited_ms = launched.elapsed().as_millis() as u64;
                    debug!(role = %self.role, waited_ms, "readiness deadline passed");
                    return ReadinessEvent::timeout(self.role, waited_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn patterns(pats: &[&str]) -> Vec<String> {
        pats.iter().map(|p| p.to_string()).collect()
    }

    #[tokio::test]
    async fn first_match_wins() {
        let watcher =
            ReadinessWatcher::new(DeviceRole::Rx1, &patterns(&["waiting.*trigger", "armed"])).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("device opened".to_string()).unwrap();
        tx.send("Trigger ARMED and waiting".to_string()).unwrap();

        let event = watcher
            .watch(rx, tokio::time::Instant::now(), Duration::from_secs(5))
            .await;
        assert!(event.is_ready());
        // First pattern in configured order that matches the line wins.
        assert_eq!(event.matched_pattern.as_deref(), Some("armed"));
    }

    #[tokio::test]
    async fn match_is_case_insensitive() {
        let watcher = ReadinessWatcher::new(DeviceRole::Rx2, &patterns(&["armed"])).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("ARMED".to_string()).unwrap();
        let event = watcher
            .watch(rx, tokio::time::Instant::now(), Duration::from_secs(5))
            .await;
        assert!(event.is_ready());
    }

    #[tokio::test]
    async fn no_patterns_means_ready_at_launch() {
        let watcher = ReadinessWatcher::new(DeviceRole::Rx1, &[]).unwrap();
        let (_tx, rx) = mpsc::unbounded_channel::<String>();
        let event = watcher
            .watch(rx, tokio::time::Instant::now(), Duration::from_secs(5))
            .await;
        assert!(event.is_ready());
        assert!(event.matched_pattern.is_none());
        assert_eq!(event.waited_ms, 0);
    }

    #[tokio::test]
    async fn times_out_without_match() {
        let watcher = ReadinessWatcher::new(DeviceRole::Rx1, &patterns(&["armed"])).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("still tuning".to_string()).unwrap();

        let event = watcher
            .watch(rx, tokio::time::Instant::now(), Duration::from_millis(100))
            .await;
        assert!(!event.is_ready());
        assert!(event.timed_out);
        assert!(event.matched_pattern.is_none());
        drop(tx);
    }

    #[tokio::test]
    async fn closed_stream_resolves_without_waiting_out_deadline() {
        let watcher = ReadinessWatcher::new(DeviceRole::Rx2, &patterns(&["armed"])).unwrap();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        drop(tx);

        let start = std::time::Instant::now();
        let event = watcher
            .watch(rx, tokio::time::Instant::now(), Duration::from_secs(30))
            .await;
        assert!(event.timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn invalid_pattern_is_a_plan_error() {
        let err = ReadinessWatcher::new(DeviceRole::Rx1, &patterns(&["(unclosed"])).unwrap_err();
        assert!(err.to_string().contains("unclosed"));
    }

    #[test]
    fn default_patterns_cover_stock_tool_output() {
        let watcher = ReadinessWatcher::new(
            DeviceRole::Rx1,
            &DEFAULT_READY_PATTERNS.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        let lines = [
            "Waiting for trigger...",
            "trigger armed",
            "ARMED",
        ];
        for line in lines {
            assert!(
                watcher.patterns.iter().any(|(re, _)| re.is_match(line)),
                "no default pattern matched {line:?}"
            );
        }
    }
}
