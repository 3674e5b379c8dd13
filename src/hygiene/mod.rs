//! Max process and session-directory hygiene
//!
//! Inventories Max instances and managed session directories, and cleans up the
//! stale ones. Sweeps are serialised and every non-dry action lands in a bounded
//! report persisted next to the bridge state.

pub mod process;
pub mod report;
pub mod sessions;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::config::{BridgeConfig, HygieneConfig};
use crate::runtime::RuntimeManager;
use crate::utils::{now_epoch_secs, path_within_root};
use crate::{Error, Result};

pub use process::{ProcessClass, ProcessProbe, ProcessRecord, SystemProbe};
pub use report::{EventKind, HygieneEvent, HygieneReport};
pub use sessions::SessionDirEntry;

use process::RawProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HygieneScope {
    ManagedOnly,
    AllInstances,
}

impl HygieneScope {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "managed_only" => Ok(HygieneScope::ManagedOnly),
            "all_instances" => Ok(HygieneScope::AllInstances),
            other => Err(Error::validation(format!(
                "Invalid hygiene scope '{other}'. Use managed_only or all_instances."
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HygieneScope::ManagedOnly => "managed_only",
            HygieneScope::AllInstances => "all_instances",
        }
    }

    fn includes(&self, record: &ProcessRecord) -> bool {
        match self {
            HygieneScope::AllInstances => true,
            HygieneScope::ManagedOnly => record.classified_as.is_managed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    Preview,
    Aggressive,
}

impl CleanupMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "preview" => Ok(CleanupMode::Preview),
            "aggressive" => Ok(CleanupMode::Aggressive),
            other => Err(Error::validation(format!(
                "Invalid cleanup mode '{other}'. Use preview or aggressive."
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMode::Preview => "preview",
            CleanupMode::Aggressive => "aggressive",
        }
    }
}

/// Which processes `close_max_system_sessions` selects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTarget {
    All,
    Stale,
    Managed,
    Custom,
}

impl CloseTarget {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(CloseTarget::All),
            "stale" => Ok(CloseTarget::Stale),
            "managed" => Ok(CloseTarget::Managed),
            "custom" => Ok(CloseTarget::Custom),
            other => Err(Error::validation(format!(
                "Invalid close target '{other}'. Use all, stale, managed or custom."
            ))),
        }
    }
}

/// Live hygiene policy; starts from [`HygieneConfig`] and can be changed at runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygienePolicy {
    pub auto_cleanup: bool,
    pub scope: HygieneScope,
    pub mode: CleanupMode,
    pub stale_secs: u64,
    pub keep_recent_sessions: usize,
    pub max_kills_per_sweep: usize,
    pub window_scan: bool,
    pub startup_sweep: bool,
    pub loop_interval_secs: f64,
    pub report_max: usize,
}

impl From<&HygieneConfig> for HygienePolicy {
    fn from(config: &HygieneConfig) -> Self {
        Self {
            auto_cleanup: config.auto_cleanup,
            scope: config.scope,
            mode: config.mode,
            stale_secs: config.stale_secs.max(1),
            keep_recent_sessions: config.keep_recent_sessions,
            max_kills_per_sweep: config.max_kills_per_sweep.max(1),
            window_scan: config.window_scan,
            startup_sweep: config.startup_sweep,
            loop_interval_secs: config.loop_interval_secs.max(10.0),
            report_max: config.report_max.max(10),
        }
    }
}

/// Partial policy change. Scope and mode arrive as strings and are validated.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyUpdate {
    pub auto_cleanup: Option<bool>,
    pub scope: Option<String>,
    pub mode: Option<String>,
    pub stale_secs: Option<u64>,
    pub keep_recent_sessions: Option<usize>,
    pub max_kills_per_sweep: Option<usize>,
    pub window_scan: Option<bool>,
    pub report_max: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowDocument {
    pub name: String,
    pub path: Option<String>,
    pub is_managed_patch: bool,
    pub session_id_guess: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowScan {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub documents: Vec<WindowDocument>,
}

impl WindowScan {
    fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
            documents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InventorySummary {
    pub max_process_count: usize,
    pub managed_process_count: usize,
    pub stale_process_count: usize,
    pub eligible_process_count: usize,
    pub session_dir_count: usize,
    pub stale_session_dir_count: usize,
    pub orphaned_session_dir_count: usize,
    pub open_document_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub timestamp: f64,
    pub bridge_connected: bool,
    pub bridge_owner_pid: Option<u32>,
    pub processes: Vec<ProcessRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_error: Option<String>,
    pub windows: WindowScan,
    pub session_dirs: Vec<SessionDirEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_state: Option<JsonValue>,
    pub policy: HygienePolicy,
    pub summary: InventorySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessAction {
    pub pid: u32,
    pub classified_as: ProcessClass,
    pub dry_run: bool,
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDirAction {
    pub session_id: String,
    pub path: String,
    pub dry_run: bool,
    pub success: bool,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub reason: &'static str,
}

impl SkippedItem {
    fn pid(pid: u32, reason: &'static str) -> Self {
        Self {
            pid: Some(pid),
            session_id: None,
            reason,
        }
    }

    fn session(session_id: &str, reason: &'static str) -> Self {
        Self {
            pid: None,
            session_id: Some(session_id.to_string()),
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupSummary {
    pub operation: &'static str,
    pub reason: String,
    pub scope: HygieneScope,
    pub mode: CleanupMode,
    pub dry_run: bool,
    pub processes_terminated: usize,
    pub sessions_deleted: usize,
    pub failed: usize,
    pub skipped: usize,
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub success: bool,
    pub summary: CleanupSummary,
    pub processes: Vec<ProcessAction>,
    pub session_dirs: Vec<SessionDirAction>,
    pub skipped: Vec<SkippedItem>,
    pub inventory_summary: InventorySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseSummary {
    pub operation: &'static str,
    pub target: CloseTarget,
    pub scope: HygieneScope,
    pub dry_run: bool,
    pub requested: usize,
    pub terminated: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub success: bool,
    pub summary: CloseSummary,
    pub actions: Vec<ProcessAction>,
    pub skipped: Vec<SkippedItem>,
}

pub struct HygieneManager {
    runtime: Arc<RuntimeManager>,
    probe: Arc<dyn ProcessProbe>,
    bridge_port: Option<u16>,
    policy: Mutex<HygienePolicy>,
    report: Mutex<HygieneReport>,
    sweep: tokio::sync::Mutex<()>,
    startup_ran: AtomicBool,
}

impl HygieneManager {
    pub fn new(config: &BridgeConfig, runtime: Arc<RuntimeManager>, probe: Arc<dyn ProcessProbe>) -> Self {
        let policy = HygienePolicy::from(&config.hygiene);
        let report = HygieneReport::load(&config.report_file(), policy.report_max);
        Self {
            runtime,
            probe,
            bridge_port: config.connection.port(),
            policy: Mutex::new(policy),
            report: Mutex::new(report),
            sweep: tokio::sync::Mutex::new(()),
            startup_ran: AtomicBool::new(false),
        }
    }

    pub fn policy_snapshot(&self) -> HygienePolicy {
        self.policy.lock().clone()
    }

    pub fn set_policy(&self, update: PolicyUpdate) -> Result<HygienePolicy> {
        let scope = update.scope.as_deref().map(HygieneScope::parse).transpose()?;
        let mode = update.mode.as_deref().map(CleanupMode::parse).transpose()?;

        let policy = {
            let mut policy = self.policy.lock();
            if let Some(v) = update.auto_cleanup {
                policy.auto_cleanup = v;
            }
            if let Some(v) = scope {
                policy.scope = v;
            }
            if let Some(v) = mode {
                policy.mode = v;
            }
            if let Some(v) = update.stale_secs {
                policy.stale_secs = v.max(1);
            }
            if let Some(v) = update.keep_recent_sessions {
                policy.keep_recent_sessions = v;
            }
            if let Some(v) = update.max_kills_per_sweep {
                policy.max_kills_per_sweep = v.max(1);
            }
            if let Some(v) = update.window_scan {
                policy.window_scan = v;
            }
            if let Some(v) = update.report_max {
                policy.report_max = v.max(10);
            }
            policy.clone()
        };

        let mut report = self.report.lock();
        report.set_max_events(policy.report_max);
        if let Err(e) = report.save(&policy) {
            tracing::warn!("Failed to persist hygiene report: {}", e);
        }
        tracing::info!("Hygiene policy updated: scope={} mode={}", policy.scope.as_str(), policy.mode.as_str());
        Ok(policy)
    }

    pub fn get_report(&self, limit: usize) -> JsonValue {
        let policy = self.policy_snapshot();
        let limit = limit.clamp(1, policy.report_max);
        self.report.lock().snapshot(limit, &policy)
    }

    async fn bridge_owner(&self, table: &[RawProcess]) -> Option<u32> {
        if !self.runtime.bridge().is_connected() {
            return None;
        }
        let listener = self.probe.listener_pid(self.bridge_port?).await?;
        let max_pids: HashSet<u32> = table
            .iter()
            .filter(|p| process::is_max_command(&p.command))
            .map(|p| p.pid)
            .collect();
        process::resolve_owner(listener, table, &max_pids)
    }

    async fn scan_windows(&self, include_windows: bool, enabled: bool) -> WindowScan {
        if !include_windows {
            return WindowScan::unavailable("not_requested");
        }
        if !enabled {
            return WindowScan::unavailable("disabled");
        }
        let root = &self.runtime.session_paths().sessions_root;
        let host_patch = self.runtime.resolve_host_patch().map(|p| resolve(&p));
        match self.probe.open_documents().await {
            Ok(raw) => WindowScan {
                available: true,
                reason: None,
                documents: raw
                    .into_iter()
                    .map(|w| annotate_window(w.name, w.path, root, host_patch.as_deref()))
                    .collect(),
            },
            Err(reason) => WindowScan::unavailable(reason),
        }
    }

    async fn collect_inventory(&self, include_windows: bool) -> Inventory {
        let policy = self.policy_snapshot();
        let paths = self.runtime.session_paths();

        let (table, process_error) = match self.probe.process_table().await {
            Ok(table) => (table, None),
            Err(e) => {
                tracing::warn!("Process table unavailable: {}", e);
                (Vec::new(), Some(e.to_string()))
            }
        };
        let owner = self.bridge_owner(&table).await;
        let processes = process::classify(&table, owner, &paths.sessions_root, policy.stale_secs);
        let live_commands: Vec<String> = processes.iter().map(|p| p.command.clone()).collect();
        let session_dirs = sessions::scan_session_dirs(
            &paths.sessions_root,
            &paths.session_id,
            policy.stale_secs,
            &live_commands,
            now_epoch_secs(),
        );
        let windows = self.scan_windows(include_windows, policy.window_scan).await;

        let summary = InventorySummary {
            max_process_count: processes.len(),
            managed_process_count: processes.iter().filter(|p| p.classified_as.is_managed()).count(),
            stale_process_count: processes.iter().filter(|p| p.is_stale).count(),
            eligible_process_count: processes.iter().filter(|p| p.eligible_for_termination).count(),
            session_dir_count: session_dirs.len(),
            stale_session_dir_count: session_dirs.iter().filter(|s| s.is_stale).count(),
            orphaned_session_dir_count: session_dirs.iter().filter(|s| s.is_orphaned).count(),
            open_document_count: windows.documents.len(),
        };

        Inventory {
            timestamp: now_epoch_secs(),
            bridge_connected: self.runtime.bridge().is_connected(),
            bridge_owner_pid: owner,
            processes,
            process_error,
            windows,
            session_dirs,
            runtime_state: None,
            policy,
            summary,
        }
    }

    /// Inventory of Max processes, open documents and session directories
    pub async fn list_system_sessions(&self, include_windows: bool, include_runtime_state: bool) -> Inventory {
        let mut inventory = self.collect_inventory(include_windows).await;
        if include_runtime_state {
            inventory.runtime_state = Some(self.runtime.runtime_state());
        }
        inventory
    }

    async fn terminate_action(&self, record: &ProcessRecord, dry_run: bool) -> ProcessAction {
        if dry_run {
            return ProcessAction {
                pid: record.pid,
                classified_as: record.classified_as,
                dry_run: true,
                success: true,
                status: "would_terminate".to_string(),
                error: None,
            };
        }
        let outcome = process::terminate(self.probe.as_ref(), record.pid).await;
        ProcessAction {
            pid: record.pid,
            classified_as: record.classified_as,
            dry_run: false,
            success: outcome.success,
            status: outcome.status.to_string(),
            error: outcome.error,
        }
    }

    fn record_events(&self, events: Vec<HygieneEvent>, summary: JsonValue) {
        let policy = self.policy_snapshot();
        let mut report = self.report.lock();
        for event in events {
            report.push(event);
        }
        report.record_run(summary);
        if let Err(e) = report.save(&policy) {
            tracing::warn!("Failed to persist hygiene report: {}", e);
        }
    }

    /// Terminate stale Max processes and delete stale session directories.
    pub async fn cleanup_hygiene(
        &self,
        mode: &str,
        include_processes: bool,
        include_session_dirs: bool,
        dry_run: bool,
        reason: &str,
    ) -> Result<CleanupReport> {
        let mode = CleanupMode::parse(mode)?;
        let dry_run = dry_run || mode == CleanupMode::Preview;
        let _sweep = self.sweep.lock().await;

        let policy = self.policy_snapshot();
        let inventory = self.collect_inventory(false).await;
        let operation = "cleanup_max_hygiene";
        let mut events = Vec::new();
        let mut skipped = Vec::new();

        let mut processes = Vec::new();
        if include_processes {
            let candidates = inventory
                .processes
                .iter()
                .filter(|p| p.eligible_for_termination && policy.scope.includes(p))
                .take(policy.max_kills_per_sweep);
            for record in candidates {
                let action = self.terminate_action(record, dry_run).await;
                if !dry_run {
                    events.push(
                        HygieneEvent::new(operation, EventKind::Process, record.pid.to_string(), action.success, action.status.as_str())
                            .with_error(action.error.clone()),
                    );
                }
                processes.push(action);
            }
        }

        let mut session_dirs = Vec::new();
        let mut reclaimed_bytes = 0_u64;
        if include_session_dirs {
            let keep: HashSet<&str> = inventory
                .session_dirs
                .iter()
                .take(policy.keep_recent_sessions)
                .map(|s| s.session_id.as_str())
                .collect();
            let root = &self.runtime.session_paths().sessions_root;

            for entry in &inventory.session_dirs {
                if entry.is_current {
                    skipped.push(SkippedItem::session(&entry.session_id, "current_session"));
                    continue;
                }
                if keep.contains(entry.session_id.as_str()) {
                    skipped.push(SkippedItem::session(&entry.session_id, "recent_retention"));
                    continue;
                }
                if !entry.is_stale {
                    continue;
                }

                let action = if dry_run {
                    SessionDirAction {
                        session_id: entry.session_id.clone(),
                        path: entry.path.display().to_string(),
                        dry_run: true,
                        success: true,
                        size_bytes: entry.size_bytes,
                        error: None,
                    }
                } else {
                    let action = remove_session_dir(entry, root);
                    if action.success {
                        reclaimed_bytes += action.size_bytes;
                    }
                    events.push(
                        HygieneEvent::new(
                            operation,
                            EventKind::SessionDir,
                            entry.session_id.as_str(),
                            action.success,
                            if action.success { "removed" } else { "failed" },
                        )
                        .with_error(action.error.clone()),
                    );
                    action
                };
                session_dirs.push(action);
            }
        }

        let failed = processes.iter().filter(|a| !a.success).count()
            + session_dirs.iter().filter(|a| !a.success).count();
        let summary = CleanupSummary {
            operation,
            reason: reason.to_string(),
            scope: policy.scope,
            mode,
            dry_run,
            processes_terminated: processes.iter().filter(|a| a.success).count(),
            sessions_deleted: session_dirs.iter().filter(|a| a.success).count(),
            failed,
            skipped: skipped.len(),
            reclaimed_bytes,
        };

        if !dry_run {
            tracing::info!(
                "Hygiene cleanup ({}): {} processes terminated, {} session dirs deleted, {} failed",
                reason,
                summary.processes_terminated,
                summary.sessions_deleted,
                failed
            );
            events.push(HygieneEvent::new(operation, EventKind::Sweep, reason, failed == 0, "completed"));
            self.record_events(events, json!(summary));
        }

        Ok(CleanupReport {
            success: failed == 0,
            summary,
            processes,
            session_dirs,
            skipped,
            inventory_summary: inventory.summary,
        })
    }

    /// Close Max processes selected by `target`. The bridge owner is never closed.
    pub async fn close_max_system_sessions(
        &self,
        target: &str,
        pids: &[u32],
        dry_run: bool,
        max_count: Option<usize>,
    ) -> Result<CloseReport> {
        let target = CloseTarget::parse(target)?;
        if target == CloseTarget::Custom && pids.is_empty() {
            return Err(Error::validation("Target 'custom' requires at least one pid."));
        }
        let _sweep = self.sweep.lock().await;

        let policy = self.policy_snapshot();
        let inventory = self.collect_inventory(false).await;
        let mut skipped = Vec::new();

        let mut selected: Vec<&ProcessRecord> = match target {
            CloseTarget::All => inventory.processes.iter().collect(),
            CloseTarget::Stale => inventory.processes.iter().filter(|p| p.is_stale).collect(),
            CloseTarget::Managed => inventory
                .processes
                .iter()
                .filter(|p| p.classified_as.is_managed())
                .collect(),
            CloseTarget::Custom => {
                let mut picked = Vec::new();
                for &pid in pids {
                    if pid <= 1 {
                        skipped.push(SkippedItem::pid(pid, "invalid_pid"));
                        continue;
                    }
                    match inventory.processes.iter().find(|p| p.pid == pid) {
                        Some(record) => picked.push(record),
                        None => skipped.push(SkippedItem::pid(pid, "not_a_max_process")),
                    }
                }
                picked
            }
        };

        selected.retain(|record| {
            let reason = if record.pid <= 1 {
                Some("invalid_pid")
            } else if record.is_bridge_owner {
                Some("bridge_owner")
            } else if !policy.scope.includes(record) {
                Some("out_of_scope")
            } else {
                None
            };
            match reason {
                Some(reason) => {
                    skipped.push(SkippedItem::pid(record.pid, reason));
                    false
                }
                None => true,
            }
        });

        if let Some(max_count) = max_count {
            for record in selected.iter().skip(max_count) {
                skipped.push(SkippedItem::pid(record.pid, "max_count"));
            }
            selected.truncate(max_count);
        }

        let operation = "close_max_system_sessions";
        let mut actions = Vec::with_capacity(selected.len());
        let mut events = Vec::new();
        for record in selected {
            let action = self.terminate_action(record, dry_run).await;
            if !dry_run {
                events.push(
                    HygieneEvent::new(operation, EventKind::Process, record.pid.to_string(), action.success, action.status.as_str())
                        .with_error(action.error.clone()),
                );
            }
            actions.push(action);
        }

        let failed = actions.iter().filter(|a| !a.success).count();
        let summary = CloseSummary {
            operation,
            target,
            scope: policy.scope,
            dry_run,
            requested: actions.len(),
            terminated: if dry_run { 0 } else { actions.len() - failed },
            failed,
            skipped: skipped.len(),
        };
        if !dry_run {
            self.record_events(events, json!(summary));
        }

        Ok(CloseReport {
            success: failed == 0,
            summary,
            actions,
            skipped,
        })
    }

    /// Policy-driven sweep; `None` when auto cleanup is off or the sweep failed.
    pub async fn run_automatic_cleanup(&self, trigger: &str) -> Option<CleanupReport> {
        let policy = self.policy_snapshot();
        if !policy.auto_cleanup {
            tracing::debug!("Hygiene auto cleanup disabled, skipping {}", trigger);
            return None;
        }
        match self
            .cleanup_hygiene(policy.mode.as_str(), true, true, false, trigger)
            .await
        {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!("Hygiene sweep {} failed: {}", trigger, e);
                None
            }
        }
    }

    pub async fn run_startup_cleanup_once(&self) -> Option<CleanupReport> {
        if self.startup_ran.swap(true, Ordering::SeqCst) {
            return None;
        }
        if !self.policy.lock().startup_sweep {
            return None;
        }
        self.run_automatic_cleanup("startup").await
    }
}

fn resolve(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Documents are managed when they are the host patch or live under the sessions root.
fn annotate_window(name: String, raw_path: String, sessions_root: &Path, host_patch: Option<&Path>) -> WindowDocument {
    let raw_path = raw_path.trim().to_string();
    let mut is_managed_patch = false;
    let mut session_id_guess = None;
    if raw_path.starts_with('/') {
        let path = Path::new(&raw_path);
        let resolved = resolve(path);
        if host_patch.is_some_and(|host| host == resolved) {
            is_managed_patch = true;
        }
        if let Ok(rel) = path.strip_prefix(sessions_root).or_else(|_| resolved.strip_prefix(sessions_root)) {
            is_managed_patch = true;
            session_id_guess = rel
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().to_string());
        }
    }
    WindowDocument {
        name: name.trim().to_string(),
        path: (!raw_path.is_empty()).then_some(raw_path),
        is_managed_patch,
        session_id_guess,
    }
}

fn remove_session_dir(entry: &SessionDirEntry, sessions_root: &Path) -> SessionDirAction {
    let mut action = SessionDirAction {
        session_id: entry.session_id.clone(),
        path: entry.path.display().to_string(),
        dry_run: false,
        success: false,
        size_bytes: entry.size_bytes,
        error: None,
    };
    if entry.path == sessions_root || !path_within_root(&entry.path, sessions_root) {
        action.error = Some("outside_sessions_root".to_string());
        return action;
    }
    match std::fs::remove_dir_all(&entry.path) {
        Ok(()) => action.success = true,
        Err(e) => action.error = Some(e.to_string()),
    }
    action
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{runtime_with, test_config_in, FakePeer, FakeProbe};
    use std::time::Duration;

    const MAX_BIN: &str = "/Applications/Max.app/Contents/MacOS/Max";

    fn raw(pid: u32, ppid: u32, elapsed: u64, command: &str) -> RawProcess {
        RawProcess {
            pid,
            ppid,
            elapsed_seconds: elapsed,
            cpu_pct: 1.0,
            rss_kb: 4096,
            command: command.to_string(),
        }
    }

    async fn manager_in(dir: &Path, tweak: impl FnOnce(&mut BridgeConfig)) -> (HygieneManager, Arc<FakeProbe>) {
        let mut config = test_config_in(dir);
        tweak(&mut config);
        let (runtime, _peer) = runtime_with(config.clone(), FakePeer::new()).await;
        let probe = FakeProbe::new();
        let manager = HygieneManager::new(&config, runtime, probe.clone());
        (manager, probe)
    }

    #[test]
    fn test_scope_and_mode_parse() {
        assert_eq!(HygieneScope::parse("Managed_Only").unwrap(), HygieneScope::ManagedOnly);
        assert_eq!(CleanupMode::parse(" preview ").unwrap(), CleanupMode::Preview);
        assert_eq!(HygieneScope::parse("everything").unwrap_err().code(), crate::error::ErrorCode::Validation);
        assert!(CloseTarget::parse("nuke").is_err());
    }

    #[tokio::test]
    async fn test_inventory_identifies_bridge_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, probe) = manager_in(dir.path(), |_| {}).await;
        probe.add_process(raw(100, 1, 9000, MAX_BIN));
        probe.add_process(raw(110, 100, 9000, "node bridge.js"));
        probe.add_process(raw(200, 1, 9000, MAX_BIN));
        probe.set_listener(110);

        let inventory = manager.list_system_sessions(false, true).await;
        assert_eq!(inventory.bridge_owner_pid, Some(100));
        assert_eq!(inventory.processes.len(), 2);
        assert_eq!(inventory.processes[0].classified_as, ProcessClass::ManagedBridgeOwner);
        assert!(!inventory.processes[0].eligible_for_termination);
        assert!(inventory.processes[1].eligible_for_termination);
        assert_eq!(inventory.windows.reason.as_deref(), Some("not_requested"));
        assert_eq!(inventory.runtime_state.unwrap()["session_id"], "testsession");
        assert_eq!(inventory.summary.session_dir_count, 1);
    }

    #[tokio::test]
    async fn test_window_scan_disabled_and_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("mcp_host.maxpat");
        let elsewhere = dir.path().join("other.maxpat");
        std::fs::write(&host, "{}").unwrap();
        std::fs::write(&elsewhere, "{}").unwrap();
        let host_path = host.clone();
        let (manager, probe) = manager_in(dir.path(), move |c| {
            c.hygiene.window_scan = true;
            c.runtime.host_patch_path = Some(host_path);
        })
        .await;
        let root = manager.runtime.session_paths().sessions_root.clone();
        probe.set_windows(vec![
            (
                "active.maxpat".to_string(),
                root.join("abc").join("active.maxpat").display().to_string(),
            ),
            ("Untitled1".to_string(), String::new()),
            ("other.maxpat".to_string(), elsewhere.display().to_string()),
            ("mcp_host.maxpat".to_string(), host.display().to_string()),
        ]);

        let scan = manager.list_system_sessions(true, false).await.windows;
        assert!(scan.available);
        assert!(scan.documents[0].is_managed_patch);
        assert_eq!(scan.documents[0].session_id_guess.as_deref(), Some("abc"));
        assert!(!scan.documents[1].is_managed_patch);
        assert_eq!(scan.documents[1].path, None);
        assert!(!scan.documents[2].is_managed_patch);
        assert!(scan.documents[3].is_managed_patch);
        assert_eq!(scan.documents[3].session_id_guess, None);

        manager
            .set_policy(PolicyUpdate {
                window_scan: Some(false),
                ..PolicyUpdate::default()
            })
            .unwrap();
        let scan = manager.list_system_sessions(true, false).await.windows;
        assert_eq!(scan.reason.as_deref(), Some("disabled"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_stale_session_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _probe) = manager_in(dir.path(), |c| {
            c.hygiene.stale_secs = 1;
            c.hygiene.keep_recent_sessions = 0;
        })
        .await;
        let root = manager.runtime.session_paths().sessions_root.clone();
        for id in ["s1", "s2", "s3"] {
            let session = root.join(id);
            std::fs::create_dir_all(&session).unwrap();
            std::fs::write(session.join("active.maxpat"), b"{\"patcher\":{}}").unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let preview = manager.cleanup_hygiene("preview", true, true, false, "test").await.unwrap();
        assert!(preview.summary.dry_run);
        assert_eq!(preview.session_dirs.len(), 3);
        assert!(root.join("s1").exists());

        let report = manager.cleanup_hygiene("aggressive", true, true, false, "test").await.unwrap();
        assert!(report.success);
        assert_eq!(report.summary.sessions_deleted, 3);
        assert!(report.summary.reclaimed_bytes > 0);
        for id in ["s1", "s2", "s3"] {
            assert!(!root.join(id).exists());
        }
        assert!(manager.runtime.session_paths().session_dir.exists());
        assert!(report
            .skipped
            .iter()
            .any(|s| s.session_id.as_deref() == Some("testsession") && s.reason == "current_session"));

        let log = manager.get_report(50);
        assert_eq!(log["last_summary"]["sessions_deleted"], 3);
        assert_eq!(log["events"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_recent_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _probe) = manager_in(dir.path(), |c| {
            c.hygiene.stale_secs = 1;
            c.hygiene.keep_recent_sessions = 5;
        })
        .await;
        let root = manager.runtime.session_paths().sessions_root.clone();
        std::fs::create_dir_all(root.join("old")).unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let report = manager.cleanup_hygiene("aggressive", false, true, false, "test").await.unwrap();
        assert_eq!(report.summary.sessions_deleted, 0);
        assert!(root.join("old").exists());
        assert!(report.skipped.iter().any(|s| s.reason == "recent_retention"));
    }

    #[tokio::test]
    async fn test_cleanup_terminates_eligible_processes_in_scope() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, probe) = manager_in(dir.path(), |c| {
            c.hygiene.stale_secs = 60;
            c.hygiene.scope = HygieneScope::ManagedOnly;
        })
        .await;
        let root = manager.runtime.session_paths().sessions_root.clone();
        let managed_cmd = format!("{MAX_BIN} {}", root.join("x").join("active.maxpat").display());
        probe.add_process(raw(300, 1, 600, &managed_cmd));
        probe.add_process(raw(301, 1, 600, MAX_BIN));
        probe.add_process(raw(302, 1, 5, &managed_cmd));

        let report = manager.cleanup_hygiene("aggressive", true, false, false, "test").await.unwrap();
        assert_eq!(report.summary.processes_terminated, 1);
        assert_eq!(report.processes[0].pid, 300);
        assert!(!probe.is_alive(300));
        assert!(probe.is_alive(301));
        assert!(probe.is_alive(302));
    }

    #[tokio::test]
    async fn test_cleanup_rejects_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, probe) = manager_in(dir.path(), |_| {}).await;
        let err = manager.cleanup_hygiene("gentle", true, true, false, "test").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
        assert_eq!(probe.table_reads(), 0);
    }

    #[tokio::test]
    async fn test_close_custom_skips_owner_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, probe) = manager_in(dir.path(), |_| {}).await;
        probe.add_process(raw(100, 1, 10, MAX_BIN));
        probe.add_process(raw(110, 100, 10, "node bridge.js"));
        probe.add_process(raw(200, 1, 10, MAX_BIN));
        probe.set_listener(110);

        let report = manager
            .close_max_system_sessions("custom", &[1, 100, 200, 4242], true, None)
            .await
            .unwrap();
        assert_eq!(report.actions.len(), 1);
        assert!(report.actions[0].dry_run);
        assert_eq!(report.actions[0].pid, 200);
        assert!(probe.is_alive(200));
        let reasons: Vec<_> = report.skipped.iter().map(|s| (s.pid, s.reason)).collect();
        assert!(reasons.contains(&(Some(1), "invalid_pid")));
        assert!(reasons.contains(&(Some(100), "bridge_owner")));
        assert!(reasons.contains(&(Some(4242), "not_a_max_process")));

        let err = manager.close_max_system_sessions("custom", &[], false, None).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_close_all_honours_max_count() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, probe) = manager_in(dir.path(), |_| {}).await;
        for pid in [501, 502, 503] {
            probe.add_process(raw(pid, 1, 10, MAX_BIN));
        }
        let report = manager.close_max_system_sessions("all", &[], false, Some(2)).await.unwrap();
        assert_eq!(report.summary.terminated, 2);
        assert_eq!(report.skipped[0].reason, "max_count");
        assert!(probe.is_alive(503));
        assert!(!probe.is_alive(501));
    }

    #[tokio::test]
    async fn test_startup_sweep_runs_once() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _probe) = manager_in(dir.path(), |_| {}).await;
        assert!(manager.run_startup_cleanup_once().await.is_some());
        assert!(manager.run_startup_cleanup_once().await.is_none());

        manager
            .set_policy(PolicyUpdate {
                auto_cleanup: Some(false),
                ..PolicyUpdate::default()
            })
            .unwrap();
        assert!(manager.run_automatic_cleanup("loop").await.is_none());
    }

    #[tokio::test]
    async fn test_set_policy_validates() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _probe) = manager_in(dir.path(), |_| {}).await;
        let err = manager
            .set_policy(PolicyUpdate {
                mode: Some("gentle".to_string()),
                ..PolicyUpdate::default()
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Validation);

        let policy = manager
            .set_policy(PolicyUpdate {
                scope: Some("managed_only".to_string()),
                stale_secs: Some(0),
                ..PolicyUpdate::default()
            })
            .unwrap();
        assert_eq!(policy.scope, HygieneScope::ManagedOnly);
        assert_eq!(policy.stale_secs, 1);
        assert_eq!(manager.get_report(10)["policy"]["scope"], "managed_only");
    }
}
