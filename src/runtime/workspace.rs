//! Workspace targets and their backing files
//!
//! The peer edits one of three targets: the managed host patch, or one of two per-session
//! documents (`active.maxpat`, `scratch.maxpat`). File-backed targets are written back after
//! every content mutation and re-applied to the peer when switched to.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use super::topology::{extract_topology, patch_template, Topology};
use super::twin::TwinSyncReport;
use super::RuntimeManager;
use crate::error::ErrorCode;
use crate::utils::{read_json, write_json_atomic};
use crate::{Error, Result};

const HYDRATE_TIMEOUT: Duration = Duration::from_secs(20);
const SET_TARGET_TIMEOUT: Duration = Duration::from_secs(3);

/// Varname prefix reserved for the bridge's own container objects
pub const PROTECTED_PREFIX: &str = "__maxbridge_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceTarget {
    Host,
    Active,
    Scratch,
}

impl WorkspaceTarget {
    pub const ALL: [WorkspaceTarget; 3] = [Self::Host, Self::Active, Self::Scratch];

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "active" => Ok(Self::Active),
            "scratch" => Ok(Self::Scratch),
            other => Err(Error::validation(format!(
                "Unknown workspace target '{other}'. Expected one of: host, active, scratch."
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Active => "active",
            Self::Scratch => "scratch",
        }
    }

    pub fn is_file_backed(&self) -> bool {
        !matches!(self, Self::Host)
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Host => "Managed bridge host patch",
            Self::Active => "Per-session editable workspace target",
            Self::Scratch => "Per-session fallback workspace target",
        }
    }
}

pub fn is_protected_varname(varname: &str) -> bool {
    varname.starts_with(PROTECTED_PREFIX)
}

/// Filesystem layout of one runtime session
#[derive(Debug, Clone, Serialize)]
pub struct SessionPaths {
    pub sessions_root: PathBuf,
    pub session_id: String,
    pub session_dir: PathBuf,
    pub active_patch: PathBuf,
    pub scratch_patch: PathBuf,
    pub checkpoints_file: PathBuf,
}

impl SessionPaths {
    pub fn new(sessions_root: &Path, session_id: &str) -> Self {
        let session_dir = sessions_root.join(session_id);
        Self {
            sessions_root: sessions_root.to_path_buf(),
            session_id: session_id.to_string(),
            active_patch: session_dir.join("active.maxpat"),
            scratch_patch: session_dir.join("scratch.maxpat"),
            checkpoints_file: session_dir.join("checkpoints.json"),
            session_dir,
        }
    }

    /// Create the session directory and any missing template documents.
    /// Returns the files that were created.
    pub fn bootstrap(&self) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.session_dir)?;
        let mut created = Vec::new();
        for path in [&self.active_patch, &self.scratch_patch] {
            if !path.exists() {
                write_json_atomic(path, &patch_template())?;
                created.push(path.clone());
            }
        }
        if !created.is_empty() {
            tracing::info!("Bootstrapped session {} at {:?}", self.session_id, self.session_dir);
        }
        Ok(created)
    }

    pub fn patch_for(&self, target: WorkspaceTarget) -> Option<&Path> {
        match target {
            WorkspaceTarget::Host => None,
            WorkspaceTarget::Active => Some(&self.active_patch),
            WorkspaceTarget::Scratch => Some(&self.scratch_patch),
        }
    }

    pub fn workspace_varname(&self, target: WorkspaceTarget) -> Option<String> {
        target
            .is_file_backed()
            .then(|| format!("{PROTECTED_PREFIX}workspace_{}_{}", target.as_str(), self.session_id))
    }

    pub fn workspace_name(&self, target: WorkspaceTarget) -> Option<String> {
        target
            .is_file_backed()
            .then(|| format!("mcp_{}_{}", target.as_str(), self.session_id))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistReport {
    pub persisted: bool,
    pub reason: String,
    pub target: WorkspaceTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PersistReport {
    fn skipped(target: WorkspaceTarget, reason: &str) -> Self {
        Self {
            persisted: false,
            reason: reason.to_string(),
            target,
            path: None,
            hash: None,
            object_count: None,
            connection_count: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HydrateReport {
    pub applied: bool,
    pub reason: String,
    pub target: WorkspaceTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HydrateReport {
    fn skipped(target: WorkspaceTarget, reason: &str) -> Self {
        Self {
            applied: false,
            reason: reason.to_string(),
            target,
            path: None,
            object_count: None,
            connection_count: None,
            bridge_result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchTargetInfo {
    pub id: WorkspaceTarget,
    pub description: &'static str,
    pub path: Option<PathBuf>,
    pub exists: bool,
    pub workspace_varname: Option<String>,
    pub selected: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetSwitchReport {
    pub active_target: WorkspaceTarget,
    pub previous_target: WorkspaceTarget,
    pub apply_result: JsonValue,
    pub persist_result: PersistReport,
    pub hydrate_result: HydrateReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub twin_sync: Option<TwinSyncReport>,
    pub targets: Vec<PatchTargetInfo>,
}

impl RuntimeManager {
    pub fn active_target(&self) -> WorkspaceTarget {
        *self.target.read()
    }

    pub fn session_paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Read the peer's current topology, retrying timeouts with linear backoff.
    pub async fn capture_live_topology(&self) -> Result<Topology> {
        let timeout = self.config.capture_timeout();
        let backoff = self.config.capture_backoff();
        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .bridge
                .send_request(json!({"action": "get_objects_in_patch"}), Some(timeout), None)
                .await;
            match outcome {
                Ok(results) if results.is_object() => return Ok(extract_topology(&results)),
                Ok(_) => {
                    return Err(Error::bridge(
                        ErrorCode::Internal,
                        "get_objects_in_patch returned a non-object result.",
                    ))
                }
                Err(e) if e.code() == ErrorCode::BridgeTimeout && attempt < self.config.capture_retries => {
                    attempt += 1;
                    tracing::debug!("Workspace capture timed out, retry {}/{}", attempt, self.config.capture_retries);
                    tokio::time::sleep(backoff * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the live topology of a file-backed target to its document.
    pub async fn persist_workspace_target(&self, target: Option<WorkspaceTarget>, reason: &str) -> PersistReport {
        let target = target.unwrap_or_else(|| self.active_target());
        let Some(path) = self.paths.patch_for(target).map(Path::to_path_buf) else {
            return PersistReport::skipped(target, "host_target");
        };
        if !self.bridge.is_connected() {
            return PersistReport::skipped(target, "bridge_disconnected");
        }

        let topology = match self.capture_live_topology().await {
            Ok(topology) => topology,
            Err(e) => {
                tracing::warn!("Workspace capture for {} failed: {}", target.as_str(), e);
                let mut report = PersistReport::skipped(target, "capture_failed");
                report.error = Some(e.to_string());
                return report;
            }
        };
        let digest = topology.digest();
        if let Err(e) = write_json_atomic(&path, &topology.to_patch_document()) {
            tracing::warn!("Failed to write workspace file {:?}: {}", path, e);
            let mut report = PersistReport::skipped(target, "write_failed");
            report.path = Some(path);
            report.error = Some(e.to_string());
            return report;
        }

        tracing::debug!("Persisted {} workspace ({}) to {:?}", target.as_str(), reason, path);
        PersistReport {
            persisted: true,
            reason: reason.to_string(),
            target,
            path: Some(path),
            hash: Some(digest.hash),
            object_count: Some(digest.object_count),
            connection_count: Some(digest.connection_count),
            error: None,
        }
    }

    /// Push a file-backed target's document to the peer.
    pub async fn hydrate_workspace_target(&self, target: Option<WorkspaceTarget>, reason: &str) -> HydrateReport {
        let target = target.unwrap_or_else(|| self.active_target());
        let Some(path) = self.paths.patch_for(target).map(Path::to_path_buf) else {
            return HydrateReport::skipped(target, "host_target");
        };
        if !self.bridge.is_connected() {
            return HydrateReport::skipped(target, "bridge_disconnected");
        }

        let topology = if path.exists() {
            match read_json(&path) {
                Ok(document) => extract_topology(&document),
                Err(e) => {
                    tracing::warn!("Unreadable workspace file {:?}, hydrating empty: {}", path, e);
                    Topology::default()
                }
            }
        } else {
            Topology::default()
        };

        let outcome = self
            .bridge
            .send_request(
                json!({"action": "apply_topology_snapshot", "snapshot": topology}),
                Some(HYDRATE_TIMEOUT),
                None,
            )
            .await;
        let mut report = HydrateReport::skipped(target, reason);
        report.path = Some(path);
        report.object_count = Some(topology.boxes.len());
        report.connection_count = Some(topology.lines.len());
        match outcome {
            Ok(result) => {
                report.applied = true;
                report.bridge_result = Some(result);
            }
            Err(e) => {
                tracing::warn!("Hydrating {} failed: {}", target.as_str(), e);
                report.reason = "bridge_apply_failed".to_string();
                report.error = Some(e.to_string());
            }
        }
        report
    }

    pub fn list_patch_targets(&self) -> Vec<PatchTargetInfo> {
        let selected = self.active_target();
        WorkspaceTarget::ALL
            .iter()
            .map(|&target| {
                let path = self.paths.patch_for(target).map(Path::to_path_buf);
                PatchTargetInfo {
                    id: target,
                    description: target.description(),
                    exists: path.as_ref().is_some_and(|p| p.exists()),
                    path,
                    workspace_varname: self.paths.workspace_varname(target),
                    selected: target == selected,
                }
            })
            .collect()
    }

    /// Switch the peer to `target`, saving the outgoing workspace and loading the incoming one.
    pub async fn set_active_target(&self, target: WorkspaceTarget) -> Result<TargetSwitchReport> {
        let previous = self.active_target();
        let switched = previous != target;

        let persist_result = if switched {
            self.persist_workspace_target(Some(previous), &format!("switch:{}->{}", previous.as_str(), target.as_str()))
                .await
        } else {
            PersistReport::skipped(previous, "not_switched")
        };

        let apply_result = if self.bridge.is_connected() {
            let mut request = json!({"action": "set_workspace_target", "target_id": target.as_str()});
            if let (Some(varname), Some(name)) = (self.paths.workspace_varname(target), self.paths.workspace_name(target)) {
                request["workspace_varname"] = json!(varname);
                request["workspace_name"] = json!(name);
            }
            let result = self
                .bridge
                .send_request(request, Some(SET_TARGET_TIMEOUT), None)
                .await
                .map_err(|e| self.bridge.operation_error("set_active_target", Some("set_workspace_target"), e))?;
            json!({"applied": true, "result": result})
        } else {
            json!({"applied": false, "reason": "bridge_disconnected"})
        };
        *self.target.write() = target;

        let hydrate_result = if !target.is_file_backed() {
            HydrateReport::skipped(target, "host_target")
        } else if switched {
            self.hydrate_workspace_target(Some(target), &format!("switch_target:{}", target.as_str()))
                .await
        } else {
            HydrateReport::skipped(target, "not_switched")
        };

        let twin_sync = if self.bridge.is_connected() && target.is_file_backed() {
            Some(self.sync_patch_twin(&format!("switch_target:{}", target.as_str())).await)
        } else {
            None
        };

        tracing::info!("Workspace target {} -> {}", previous.as_str(), target.as_str());
        Ok(TargetSwitchReport {
            active_target: target,
            previous_target: previous,
            apply_result,
            persist_result,
            hydrate_result,
            twin_sync,
            targets: self.list_patch_targets(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_peer;

    #[test]
    fn test_target_parsing_and_names() {
        assert_eq!(WorkspaceTarget::parse(" Scratch ").unwrap(), WorkspaceTarget::Scratch);
        assert_eq!(WorkspaceTarget::parse("nope").unwrap_err().code(), ErrorCode::Validation);

        let paths = SessionPaths::new(Path::new("/tmp/sessions"), "abc");
        assert_eq!(
            paths.workspace_varname(WorkspaceTarget::Active).as_deref(),
            Some("__maxbridge_workspace_active_abc")
        );
        assert_eq!(paths.workspace_name(WorkspaceTarget::Scratch).as_deref(), Some("mcp_scratch_abc"));
        assert!(paths.workspace_varname(WorkspaceTarget::Host).is_none());
        assert!(is_protected_varname("__maxbridge_workspace_active_abc"));
    }

    #[tokio::test]
    async fn test_switch_persists_and_hydrates() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;

        runtime
            .bridge()
            .send_request(json!({"action": "add_object", "obj_type": "dac~", "varname": "out"}), None, None)
            .await
            .unwrap();

        let report = runtime.set_active_target(WorkspaceTarget::Scratch).await.unwrap();
        assert_eq!(report.previous_target, WorkspaceTarget::Active);
        assert!(report.persist_result.persisted);
        assert!(report.hydrate_result.applied);
        assert_eq!(peer.target(), "scratch");
        // Scratch starts empty
        assert_eq!(peer.box_count(), 0);

        let active = read_json(&runtime.session_paths().active_patch).unwrap();
        assert_eq!(extract_topology(&active).boxes.len(), 1);

        let back = runtime.set_active_target(WorkspaceTarget::Active).await.unwrap();
        assert!(back.hydrate_result.applied);
        assert_eq!(peer.box_count(), 1);
        let selected: Vec<_> = back.targets.iter().filter(|t| t.selected).map(|t| t.id).collect();
        assert_eq!(selected, vec![WorkspaceTarget::Active]);
    }

    #[tokio::test]
    async fn test_rejected_switch_keeps_previous_target() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;
        peer.fail_action("set_workspace_target", "PRECONDITION_FAILED", "workspace locked");

        let err = runtime.set_active_target(WorkspaceTarget::Host).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Precondition);
        assert_eq!(runtime.active_target(), WorkspaceTarget::Active);
        assert_eq!(peer.target(), "active");

        peer.clear_failure("set_workspace_target");
        let report = runtime.set_active_target(WorkspaceTarget::Scratch).await.unwrap();
        assert_eq!(report.previous_target, WorkspaceTarget::Active);
        assert_eq!(runtime.active_target(), WorkspaceTarget::Scratch);
    }

    #[tokio::test]
    async fn test_host_target_is_not_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _peer) = runtime_with_peer(dir.path()).await;
        let report = runtime.set_active_target(WorkspaceTarget::Host).await.unwrap();
        assert_eq!(report.hydrate_result.reason, "host_target");
        assert!(report.twin_sync.is_none());
        let persisted = runtime.persist_workspace_target(None, "manual").await;
        assert_eq!(persisted.reason, "host_target");
    }

    #[tokio::test]
    async fn test_capture_retries_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;
        peer.drop_action("get_objects_in_patch");
        let err = runtime.capture_live_topology().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeTimeout);
        // One attempt plus the configured retries
        assert_eq!(peer.count("get_objects_in_patch"), 3);
    }
}
