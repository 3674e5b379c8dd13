//! Runtime manager
//!
//! Session-scoped state layered on the bridge connection: workspace targets and their
//! documents, the patch twin, checkpoints, patch file I/O and transactional plans.

pub mod checkpoints;
pub mod object_rules;
pub mod patch_io;
pub mod plan;
pub mod topology;
pub mod transaction;
pub mod twin;
pub mod workspace;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value as JsonValue};

use crate::bridge::{actions, ActionObserver, BridgeConnection};
use crate::catalog::ObjectCatalog;
use crate::config::{BridgeConfig, RuntimeConfig};
use crate::error::{BridgeError, ErrorCode};
use crate::utils::absolutize;
use crate::{Error, Result};

pub use checkpoints::{CheckpointCreated, CheckpointJournal, CheckpointRestored, CheckpointSummary};
pub use patch_io::{ImportReport, LoadMode, LoadOptions, SaveReport, ValidationReport};
pub use plan::{DryRunEngine, DryRunOptions, DryRunReport, PlanStep, UnknownActionPolicy};
pub use topology::{Topology, TopologyDigest};
pub use transaction::{TransactionOptions, TransactionReport};
pub use twin::{DriftReport, TwinState, TwinSyncReport};
pub use workspace::{SessionPaths, TargetSwitchReport, WorkspaceTarget, PROTECTED_PREFIX};

pub struct RuntimeManager {
    bridge: Arc<BridgeConnection>,
    config: RuntimeConfig,
    strict_gating: bool,
    paths: SessionPaths,
    allowed_roots: Vec<PathBuf>,
    target: RwLock<WorkspaceTarget>,
    twin: Mutex<TwinState>,
    journal: Mutex<CheckpointJournal>,
    catalog: Option<Arc<dyn ObjectCatalog>>,
}

impl RuntimeManager {
    /// Bootstrap the session directory, load the checkpoint journal and register
    /// as the bridge's after-action observer.
    pub fn new(
        bridge: Arc<BridgeConnection>,
        config: &BridgeConfig,
        catalog: Option<Arc<dyn ObjectCatalog>>,
    ) -> Result<Arc<Self>> {
        let runtime = config.runtime.clone();
        let session_id = runtime
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()[..12].to_string());

        let paths = SessionPaths::new(&absolutize(&config.sessions_root()), &session_id);
        paths.bootstrap()?;

        let journal = CheckpointJournal::load(&paths.checkpoints_file, &session_id, runtime.checkpoint_max);
        let allowed_roots = resolve_allowed_roots(&runtime, &paths);

        let manager = Arc::new(Self {
            strict_gating: config.connection.strict_capability_gating,
            twin: Mutex::new(TwinState::new(runtime.twin_auto_sync)),
            target: RwLock::new(WorkspaceTarget::Active),
            journal: Mutex::new(journal),
            config: runtime,
            bridge,
            paths,
            allowed_roots,
            catalog,
        });

        let weak: Weak<dyn ActionObserver> = Arc::downgrade(&manager) as Weak<dyn ActionObserver>;
        manager.bridge.set_observer(weak);
        tracing::info!(
            "Runtime session {} at {:?}",
            manager.paths.session_id,
            manager.paths.session_dir
        );
        Ok(manager)
    }

    pub fn bridge(&self) -> &Arc<BridgeConnection> {
        &self.bridge
    }

    pub fn session_id(&self) -> &str {
        &self.paths.session_id
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    pub fn catalog(&self) -> Option<&Arc<dyn ObjectCatalog>> {
        self.catalog.as_ref()
    }

    /// Summary for diagnostics
    pub fn runtime_state(&self) -> JsonValue {
        let checkpoints = self.journal.lock().len();
        json!({
            "session_id": self.paths.session_id,
            "session_dir": self.paths.session_dir,
            "sessions_root": self.paths.sessions_root,
            "active_target": self.active_target(),
            "checkpoints": checkpoints,
            "twin": self.twin_status(),
            "enforce_patch_roots": self.config.enforce_patch_roots,
            "allowed_patch_roots": self.allowed_roots,
            "catalog_loaded": self.catalog.as_ref().is_some_and(|c| !c.is_empty()),
            "host_patch_path": self.resolve_host_patch(),
        })
    }

    /// The configured host patch, or its fallback, whichever exists on disk.
    pub fn resolve_host_patch(&self) -> Option<PathBuf> {
        [&self.config.host_patch_path, &self.config.fallback_patch_path]
            .into_iter()
            .flatten()
            .find(|path| path.exists())
            .cloned()
    }

    fn host_blocked(&self, operation: &str) -> Error {
        Error::Bridge(
            BridgeError::new(
                ErrorCode::Precondition,
                format!("{operation} is not available while the host patch is the active target."),
            )
            .recoverable(false)
            .with_hint("Switch to the active or scratch workspace target first.")
            .with_detail("operation", operation)
            .with_detail("target", WorkspaceTarget::Host.as_str()),
        )
    }

    /// Refuse up front when the peer is known to lack any of `required`.
    fn require_capabilities(&self, operation: &str, required: &[&str]) -> Result<()> {
        if !self.strict_gating {
            return Ok(());
        }
        self.bridge
            .capabilities()
            .require_all(operation, required)
            .map_err(Error::Bridge)
    }
}

fn resolve_allowed_roots(config: &RuntimeConfig, paths: &SessionPaths) -> Vec<PathBuf> {
    if !config.enforce_patch_roots {
        return Vec::new();
    }
    let roots: Vec<PathBuf> = config.allowed_patch_roots.iter().map(|p| absolutize(p)).collect();
    if !roots.is_empty() {
        return roots;
    }
    let mut defaults = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        defaults.push(cwd);
    }
    defaults.push(paths.session_dir.clone());
    defaults
}

#[async_trait]
impl ActionObserver for RuntimeManager {
    async fn after_successful_action(&self, action: &str, _payload: &Map<String, JsonValue>, _results: &JsonValue) {
        let reason = format!("mutation:{action}");
        let auto_sync = self.twin.lock().auto_sync_enabled;
        if auto_sync && actions::is_topology_mutation(action) {
            let report = self.sync_patch_twin(&reason).await;
            if !report.success {
                tracing::debug!("Twin auto-sync after {} skipped: {:?}", action, report.error);
            }
        }

        if actions::persists_workspace(action) && self.active_target().is_file_backed() {
            let report = self.persist_workspace_target(None, &reason).await;
            if !report.persisted {
                tracing::debug!("Workspace not persisted after {}: {}", action, report.reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_peer;
    use crate::utils::read_json;

    #[tokio::test]
    async fn test_session_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _peer) = runtime_with_peer(dir.path()).await;
        let paths = runtime.session_paths();
        assert_eq!(runtime.session_id(), "testsession");
        assert!(paths.active_patch.exists());
        assert!(paths.scratch_patch.exists());
        let document = read_json(&paths.active_patch).unwrap();
        assert!(document["patcher"]["boxes"].as_array().unwrap().is_empty());
        assert_eq!(runtime.active_target(), WorkspaceTarget::Active);
    }

    #[tokio::test]
    async fn test_mutation_hook_syncs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _peer) = runtime_with_peer(dir.path()).await;

        runtime
            .bridge()
            .send_request(json!({"action": "add_object", "obj_type": "metro 100", "varname": "clock"}), None, None)
            .await
            .unwrap();

        let twin = runtime.twin_status();
        assert_eq!(twin.last_reason.as_deref(), Some("mutation:add_object"));
        assert_eq!(twin.baseline_object_count, 1);

        let document = read_json(&runtime.session_paths().active_patch).unwrap();
        assert_eq!(document["patcher"]["boxes"][0]["box"]["varname"], "clock");
    }

    #[tokio::test]
    async fn test_host_blocked_error_shape() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _peer) = runtime_with_peer(dir.path()).await;
        let err = runtime.host_blocked("create_checkpoint").into_bridge_error();
        assert_eq!(err.code, ErrorCode::Precondition);
        assert!(err.hint.is_some());
        assert_eq!(err.details["target"], "host");
    }
}
