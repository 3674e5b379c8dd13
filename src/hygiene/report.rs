//! Bounded hygiene event log, persisted alongside the bridge state

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::HygienePolicy;
use crate::utils::{now_epoch_secs, write_json_atomic};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Process,
    SessionDir,
    Sweep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneEvent {
    pub timestamp: f64,
    pub operation: String,
    pub kind: EventKind,
    pub target: String,
    pub success: bool,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HygieneEvent {
    pub fn new(operation: &str, kind: EventKind, target: impl Into<String>, success: bool, status: impl Into<String>) -> Self {
        Self {
            timestamp: now_epoch_secs(),
            operation: operation.to_string(),
            kind,
            target: target.into(),
            success,
            status: status.into(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }
}

#[derive(Debug, Default, Deserialize)]
struct StoredReport {
    #[serde(default)]
    last_run_at: Option<f64>,
    #[serde(default)]
    last_summary: Option<JsonValue>,
    #[serde(default)]
    events: Vec<JsonValue>,
}

#[derive(Debug)]
pub struct HygieneReport {
    path: PathBuf,
    max_events: usize,
    events: VecDeque<HygieneEvent>,
    last_run_at: Option<f64>,
    last_summary: Option<JsonValue>,
}

impl HygieneReport {
    /// Reload the report at `path`. Unreadable files start an empty log.
    pub fn load(path: &Path, max_events: usize) -> Self {
        let stored = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<StoredReport>(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable hygiene report {:?}: {}", path, e);
                StoredReport::default()
            }),
            Err(_) => StoredReport::default(),
        };

        let mut report = Self {
            path: path.to_path_buf(),
            max_events,
            events: VecDeque::new(),
            last_run_at: stored.last_run_at,
            last_summary: stored.last_summary,
        };
        for raw in stored.events {
            if let Ok(event) = serde_json::from_value(raw) {
                report.push(event);
            }
        }
        report
    }

    pub fn push(&mut self, event: HygieneEvent) {
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    pub fn set_max_events(&mut self, max_events: usize) {
        self.max_events = max_events;
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    pub fn record_run(&mut self, summary: JsonValue) {
        self.last_run_at = Some(now_epoch_secs());
        self.last_summary = Some(summary);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn save(&self, policy: &HygienePolicy) -> Result<()> {
        write_json_atomic(
            &self.path,
            &json!({
                "updated_at": now_epoch_secs(),
                "last_run_at": self.last_run_at,
                "last_summary": self.last_summary,
                "events": self.events,
                "policy": policy,
            }),
        )
    }

    /// The most recent `limit` events, oldest first
    pub fn snapshot(&self, limit: usize, policy: &HygienePolicy) -> JsonValue {
        let skip = self.events.len().saturating_sub(limit);
        let events: Vec<&HygieneEvent> = self.events.iter().skip(skip).collect();
        json!({
            "report_file": self.path,
            "last_run_at": self.last_run_at,
            "last_summary": self.last_summary,
            "event_count": self.events.len(),
            "events": events,
            "policy": policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hygiene_report.json");
        let policy = HygienePolicy::from(&crate::config::HygieneConfig::default());

        let mut report = HygieneReport::load(&path, 10);
        for pid in 0..15 {
            report.push(HygieneEvent::new("cleanup", EventKind::Process, pid.to_string(), true, "terminated"));
        }
        report.record_run(json!({"processes_terminated": 15}));
        report.save(&policy).unwrap();
        assert_eq!(report.len(), 10);

        let reloaded = HygieneReport::load(&path, 10);
        assert_eq!(reloaded.len(), 10);
        let snapshot = reloaded.snapshot(3, &policy);
        assert_eq!(snapshot["events"].as_array().unwrap().len(), 3);
        assert_eq!(snapshot["events"][2]["target"], "14");
        assert_eq!(snapshot["last_summary"]["processes_terminated"], 15);
    }

    #[test]
    fn test_corrupt_report_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hygiene_report.json");
        std::fs::write(&path, "{{{").unwrap();
        assert!(HygieneReport::load(&path, 10).is_empty());
    }
}
