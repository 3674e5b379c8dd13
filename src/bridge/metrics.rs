//! Request metrics, event log and rolling alerts

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};

use super::admission::GateSnapshot;
use crate::config::MetricsConfig;
use crate::utils::now_epoch_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleState {
    Succeeded,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub duration_ms: f64,
    pub queue_wait_ms: f64,
    pub timestamp: f64,
    pub action: String,
    pub state: SampleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub timestamp: f64,
    pub level: Level,
    pub code: String,
    pub message: String,
    pub action: Option<String>,
    pub request_id: Option<String>,
    pub details: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertCode {
    #[serde(rename = "ALERT_FAILURE_RATE")]
    FailureRate,
    #[serde(rename = "ALERT_P95_LATENCY")]
    P95Latency,
    #[serde(rename = "ALERT_QUEUE_SATURATION")]
    QueueSaturation,
}

impl AlertCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCode::FailureRate => "ALERT_FAILURE_RATE",
            AlertCode::P95Latency => "ALERT_P95_LATENCY",
            AlertCode::QueueSaturation => "ALERT_QUEUE_SATURATION",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub code: AlertCode,
    pub severity: Level,
    pub message: &'static str,
    pub current: f64,
    pub threshold: f64,
    pub guidance: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollingWindow {
    pub window_seconds: f64,
    pub request_count: usize,
    pub failure_count: usize,
    pub failure_rate: f64,
    pub p95_latency_ms: Option<f64>,
    pub queue_depth_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActionStats {
    pub requests: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timeouts: u64,
}

/// Wall-clock markers used by the health snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct Timeline {
    pub last_request_at: Option<f64>,
    pub last_response_at: Option<f64>,
    pub last_successful_request_at: Option<f64>,
    pub last_failed_request_at: Option<f64>,
    pub last_timeout_at: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_timeouts: u64,
    pub consecutive_failures: u64,
}

struct MetricsState {
    totals: Totals,
    timeline: Timeline,
    actions: BTreeMap<String, ActionStats>,
    samples: VecDeque<Sample>,
    events: VecDeque<Event>,
    last_log_emit_at: Option<f64>,
}

pub struct BridgeMetrics {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
}

/// Linear-interpolated percentile, `pct` in `[0, 1]`
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut ordered = values.to_vec();
    ordered.sort_by(|a, b| a.total_cmp(b));
    if ordered.len() == 1 {
        return Some(ordered[0]);
    }
    let idx = (ordered.len() - 1) as f64 * pct.clamp(0.0, 1.0);
    let lower = idx.floor() as usize;
    let upper = (lower + 1).min(ordered.len() - 1);
    if lower == upper {
        return Some(ordered[lower]);
    }
    let frac = idx - lower as f64;
    Some(ordered[lower] + (ordered[upper] - ordered[lower]) * frac)
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl BridgeMetrics {
    pub fn new(config: &MetricsConfig) -> Self {
        Self {
            config: config.clone(),
            state: Mutex::new(MetricsState {
                totals: Totals::default(),
                timeline: Timeline::default(),
                actions: BTreeMap::new(),
                samples: VecDeque::with_capacity(config.sample_size),
                events: VecDeque::with_capacity(config.event_log_size),
                last_log_emit_at: None,
            }),
        }
    }

    /// Count a request for `action` before any local check runs.
    pub fn note_attempt(&self, action: &str) {
        self.state
            .lock()
            .actions
            .entry(action.to_string())
            .or_default()
            .requests += 1;
    }

    /// Count a request that actually went out on the wire.
    pub fn note_emitted(&self) {
        let mut state = self.state.lock();
        state.totals.total_requests += 1;
        state.timeline.last_request_at = Some(now_epoch_secs());
    }

    pub fn record_success(&self, action: &str, duration: Duration, queue_wait: Duration) {
        let now = now_epoch_secs();
        let mut state = self.state.lock();
        state.totals.total_successes += 1;
        state.totals.consecutive_failures = 0;
        state.timeline.last_response_at = Some(now);
        state.timeline.last_successful_request_at = Some(now);
        state.actions.entry(action.to_string()).or_default().succeeded += 1;
        self.push_sample(&mut state, action, duration, queue_wait, SampleState::Succeeded, None);
    }

    /// A peer-reported failure. The response did arrive.
    pub fn record_failure(
        &self,
        action: &str,
        duration: Duration,
        queue_wait: Duration,
        code: &str,
        message: &str,
        request_id: Option<&str>,
        details: Map<String, JsonValue>,
    ) {
        let now = now_epoch_secs();
        {
            let mut state = self.state.lock();
            state.timeline.last_response_at = Some(now);
            Self::count_failure(&mut state, action, now);
            self.push_sample(
                &mut state,
                action,
                duration,
                queue_wait,
                SampleState::Failed,
                Some(code.to_string()),
            );
        }
        self.push_event(Level::Error, code, message, Some(action), request_id, details);
    }

    pub fn record_timeout(
        &self,
        action: &str,
        duration: Duration,
        queue_wait: Duration,
        request_id: &str,
        message: &str,
    ) {
        let now = now_epoch_secs();
        {
            let mut state = self.state.lock();
            state.totals.total_timeouts += 1;
            state.timeline.last_timeout_at = Some(now);
            Self::count_failure(&mut state, action, now);
            state.actions.entry(action.to_string()).or_default().timeouts += 1;
            self.push_sample(
                &mut state,
                action,
                duration,
                queue_wait,
                SampleState::Timeout,
                Some("BRIDGE_TIMEOUT".to_string()),
            );
        }
        self.push_event(Level::Warn, "BRIDGE_TIMEOUT", message, Some(action), Some(request_id), Map::new());
    }

    /// A local refusal (admission, transport) that produced no latency sample.
    pub fn record_rejection(&self, action: &str, level: Level, code: &str, message: &str, details: Map<String, JsonValue>) {
        {
            let mut state = self.state.lock();
            Self::count_failure(&mut state, action, now_epoch_secs());
        }
        self.push_event(level, code, message, Some(action), None, details);
    }

    pub fn push_event(
        &self,
        level: Level,
        code: &str,
        message: &str,
        action: Option<&str>,
        request_id: Option<&str>,
        details: Map<String, JsonValue>,
    ) {
        let mut state = self.state.lock();
        if state.events.len() >= self.config.event_log_size {
            state.events.pop_front();
        }
        state.events.push_back(Event {
            timestamp: now_epoch_secs(),
            level,
            code: code.to_string(),
            message: message.to_string(),
            action: action.map(str::to_string),
            request_id: request_id.map(str::to_string),
            details,
        });
    }

    fn count_failure(state: &mut MetricsState, action: &str, now: f64) {
        state.totals.total_failures += 1;
        state.totals.consecutive_failures += 1;
        state.timeline.last_failed_request_at = Some(now);
        state.actions.entry(action.to_string()).or_default().failed += 1;
    }

    fn push_sample(
        &self,
        state: &mut MetricsState,
        action: &str,
        duration: Duration,
        queue_wait: Duration,
        sample_state: SampleState,
        code: Option<String>,
    ) {
        if state.samples.len() >= self.config.sample_size {
            state.samples.pop_front();
        }
        state.samples.push_back(Sample {
            duration_ms: round_to(duration.as_secs_f64() * 1000.0, 3),
            queue_wait_ms: round_to(queue_wait.as_secs_f64() * 1000.0, 3),
            timestamp: now_epoch_secs(),
            action: action.to_string(),
            state: sample_state,
            code,
        });
    }

    pub fn totals(&self) -> Totals {
        self.state.lock().totals.clone()
    }

    pub fn timeline(&self) -> Timeline {
        self.state.lock().timeline.clone()
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        let state = self.state.lock();
        let skip = state.events.len().saturating_sub(limit.max(1));
        state.events.iter().skip(skip).cloned().collect()
    }

    /// Alerts over the samples inside the rolling window.
    pub fn compute_alerts(&self, gate: &GateSnapshot) -> (Vec<Alert>, RollingWindow) {
        let cfg = &self.config;
        let threshold = now_epoch_secs() - cfg.alert_window_secs;
        let (durations, failure_count) = {
            let state = self.state.lock();
            let window: Vec<&Sample> = state.samples.iter().filter(|s| s.timestamp >= threshold).collect();
            let failures = window
                .iter()
                .filter(|s| matches!(s.state, SampleState::Failed | SampleState::Timeout))
                .count();
            (window.iter().map(|s| s.duration_ms).collect::<Vec<f64>>(), failures)
        };

        let request_count = durations.len();
        let failure_rate = if request_count > 0 {
            failure_count as f64 / request_count as f64
        } else {
            0.0
        };
        let p95 = percentile(&durations, 0.95);
        let queue_depth_ratio = gate.queued as f64 / gate.max_queue.max(1) as f64;

        let mut alerts = Vec::new();
        let rate_thr = cfg.alert_failure_rate;
        if request_count > 0 && failure_rate >= rate_thr {
            alerts.push(Alert {
                code: AlertCode::FailureRate,
                severity: if failure_rate >= (rate_thr * 2.0).max(rate_thr + 0.20) {
                    Level::Error
                } else {
                    Level::Warn
                },
                message: "Rolling bridge failure rate exceeded threshold.",
                current: round_to(failure_rate, 4),
                threshold: rate_thr,
                guidance: "Inspect get_bridge_diagnostics() and recent bridge events.",
            });
        }

        let p95_thr = cfg.alert_p95_ms;
        if let Some(p95) = p95.filter(|p| *p >= p95_thr) {
            alerts.push(Alert {
                code: AlertCode::P95Latency,
                severity: if p95 >= (p95_thr * 2.0).max(p95_thr + 1000.0) {
                    Level::Error
                } else {
                    Level::Warn
                },
                message: "Rolling p95 latency exceeded threshold.",
                current: round_to(p95, 3),
                threshold: p95_thr,
                guidance: "Inspect queue pressure and increase operation timeouts for large patches.",
            });
        }

        if queue_depth_ratio >= cfg.alert_queue_depth {
            alerts.push(Alert {
                code: AlertCode::QueueSaturation,
                severity: Level::Warn,
                message: "Mutation queue depth ratio exceeded threshold.",
                current: round_to(queue_depth_ratio, 4),
                threshold: cfg.alert_queue_depth,
                guidance: "Reduce concurrent mutation traffic or increase queue/inflight limits.",
            });
        }

        let rolling = RollingWindow {
            window_seconds: cfg.alert_window_secs,
            request_count,
            failure_count,
            failure_rate: round_to(failure_rate, 4),
            p95_latency_ms: p95,
            queue_depth_ratio: round_to(queue_depth_ratio, 4),
        };
        (alerts, rolling)
    }

    pub fn snapshot(&self, gate: &GateSnapshot, include_events: bool, event_limit: usize) -> JsonValue {
        let (alerts, rolling) = self.compute_alerts(gate);
        let state = self.state.lock();
        let durations: Vec<f64> = state.samples.iter().map(|s| s.duration_ms).collect();
        let waits: Vec<f64> = state.samples.iter().map(|s| s.queue_wait_ms).collect();

        let mut snapshot = json!({
            "protocol_version": super::envelope::PROTOCOL_VERSION,
            "total_requests": state.totals.total_requests,
            "total_successes": state.totals.total_successes,
            "total_failures": state.totals.total_failures,
            "total_timeouts": state.totals.total_timeouts,
            "latency_samples": state.samples.len(),
            "latency_ms": {
                "p50": percentile(&durations, 0.50),
                "p95": percentile(&durations, 0.95),
                "p99": percentile(&durations, 0.99),
                "max": max_of(&durations),
            },
            "queue_wait_ms": {
                "p50": percentile(&waits, 0.50),
                "p95": percentile(&waits, 0.95),
                "max": max_of(&waits),
                "total_seconds": round_to(gate.total_queue_wait_ms / 1000.0, 6),
            },
            "mutation_queue": gate,
            "actions": state.actions,
            "alerts": alerts,
            "rolling_window": rolling,
            "last_log_emit_at": state.last_log_emit_at,
        });

        if include_events {
            let skip = state.events.len().saturating_sub(event_limit.max(1));
            let events: Vec<&Event> = state.events.iter().skip(skip).collect();
            snapshot["recent_events"] = json!(events);
        }
        snapshot
    }

    /// Emit the periodic `MAXBRIDGE_METRICS` line and push current alerts as events.
    /// Returns `None` if called again before the log interval elapsed, unless `force`.
    pub fn emit_log(&self, gate: &GateSnapshot, endpoint: &str, connected: bool, force: bool) -> Option<JsonValue> {
        let now = now_epoch_secs();
        {
            let state = self.state.lock();
            if let Some(last) = state.last_log_emit_at {
                if !force && now - last < self.config.log_interval_secs {
                    return None;
                }
            }
        }

        let (alerts, _) = self.compute_alerts(gate);
        let payload = json!({
            "type": "maxbridge.metrics",
            "timestamp": now,
            "endpoint": endpoint,
            "connected": connected,
            "metrics": self.snapshot(gate, false, 0),
        });
        tracing::info!("MAXBRIDGE_METRICS {}", payload);

        for alert in alerts {
            let mut details = Map::new();
            details.insert("current".into(), json!(alert.current));
            details.insert("threshold".into(), json!(alert.threshold));
            details.insert("guidance".into(), json!(alert.guidance));
            self.push_event(alert.severity, alert.code.as_str(), alert.message, None, None, details);
        }
        self.state.lock().last_log_emit_at = Some(now);
        Some(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(queued: usize, max_queue: usize) -> GateSnapshot {
        GateSnapshot {
            inflight: 0,
            queued,
            max_inflight: 4,
            max_queue,
            max_depth_seen: queued,
            rejections: 0,
            timeouts: 0,
            admitted: 0,
            total_queue_wait_ms: 0.0,
        }
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [10.0, 20.0, 30.0, 40.0];
        assert_eq!(percentile(&values, 0.5), Some(25.0));
        assert_eq!(percentile(&values, 1.0), Some(40.0));
        assert_eq!(percentile(&[7.0], 0.95), Some(7.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn test_failure_rate_alert_severity() {
        let metrics = BridgeMetrics::new(&MetricsConfig::default());
        for _ in 0..6 {
            metrics.record_success("add_object", Duration::from_millis(5), Duration::ZERO);
        }
        for _ in 0..4 {
            metrics.record_timeout("add_object", Duration::from_millis(5), Duration::ZERO, "r", "slow");
        }

        let (alerts, rolling) = metrics.compute_alerts(&gate(0, 64));
        assert_eq!(rolling.request_count, 10);
        assert_eq!(rolling.failure_count, 4);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, AlertCode::FailureRate);
        // 0.4 >= max(0.2, 0.3)
        assert_eq!(alerts[0].severity, Level::Error);
    }

    #[test]
    fn test_queue_saturation_at_full_queue() {
        let metrics = BridgeMetrics::new(&MetricsConfig::default());
        let (alerts, _) = metrics.compute_alerts(&gate(12, 12));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].code, AlertCode::QueueSaturation);

        let (alerts, _) = metrics.compute_alerts(&gate(9, 12));
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_snapshot_and_event_ring() {
        let config = MetricsConfig {
            event_log_size: 8,
            ..MetricsConfig::default()
        };
        let metrics = BridgeMetrics::new(&config);
        metrics.note_attempt("remove_object");
        metrics.note_emitted();
        metrics.record_failure(
            "remove_object",
            Duration::from_millis(12),
            Duration::ZERO,
            "OBJECT_NOT_FOUND",
            "missing",
            Some("req-1"),
            Map::new(),
        );
        for i in 0..20 {
            metrics.push_event(Level::Info, "NOTE", &format!("n{i}"), None, None, Map::new());
        }

        let snapshot = metrics.snapshot(&gate(0, 64), true, 5);
        assert_eq!(snapshot["total_failures"], 1);
        assert_eq!(snapshot["actions"]["remove_object"]["failed"], 1);
        assert_eq!(snapshot["recent_events"].as_array().unwrap().len(), 5);
        assert_eq!(metrics.recent_events(100).len(), 8);
        assert_eq!(metrics.totals().consecutive_failures, 1);
    }

    #[test]
    fn test_emit_log_respects_interval() {
        let metrics = BridgeMetrics::new(&MetricsConfig::default());
        assert!(metrics.emit_log(&gate(0, 64), "ws://x", true, false).is_some());
        assert!(metrics.emit_log(&gate(0, 64), "ws://x", true, false).is_none());
        assert!(metrics.emit_log(&gate(0, 64), "ws://x", true, true).is_some());
    }
}
