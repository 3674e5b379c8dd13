//! Durable checkpoints
//!
//! Each checkpoint stores a full topology snapshot of the workspace. The journal lives at
//! `<session_dir>/checkpoints.json` and is rewritten atomically on every change; a journal
//! that cannot be read is treated as empty.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};

use super::topology::{extract_topology, Topology};
use super::twin::TwinSyncReport;
use super::workspace::WorkspaceTarget;
use super::RuntimeManager;
use crate::error::{BridgeError, ErrorCode};
use crate::utils::{now_epoch_secs, read_json, write_json_atomic};
use crate::{Error, Result};

const RESTORE_TIMEOUT: Duration = Duration::from_secs(20);
const CONTEXT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub label: String,
    pub created_at: f64,
    pub hash: String,
    pub object_count: usize,
    pub connection_count: usize,
    pub target: WorkspaceTarget,
    pub context: Map<String, JsonValue>,
    pub topology: Topology,
}

/// Checkpoint without its snapshot payload
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub label: String,
    pub created_at: f64,
    pub hash: String,
    pub object_count: usize,
    pub connection_count: usize,
    pub target: WorkspaceTarget,
}

impl Checkpoint {
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            label: self.label.clone(),
            created_at: self.created_at,
            hash: self.hash.clone(),
            object_count: self.object_count,
            connection_count: self.connection_count,
            target: self.target,
        }
    }

    /// Rebuild an entry from a journal row, filling in anything derivable.
    fn from_journal_row(raw: &JsonValue) -> Option<Self> {
        let checkpoint_id = raw
            .get("checkpoint_id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())?
            .to_string();
        let raw_topology = raw.get("topology").filter(|t| t.is_object())?;
        let topology = extract_topology(raw_topology);
        let digest = topology.digest();

        let count = |key: &str, fallback: usize| {
            raw.get(key)
                .and_then(JsonValue::as_u64)
                .map(|n| n as usize)
                .unwrap_or(fallback)
        };
        Some(Self {
            checkpoint_id,
            label: raw.get("label").and_then(JsonValue::as_str).unwrap_or_default().to_string(),
            created_at: raw
                .get("created_at")
                .and_then(JsonValue::as_f64)
                .unwrap_or_else(now_epoch_secs),
            hash: raw
                .get("hash")
                .and_then(JsonValue::as_str)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .unwrap_or(digest.hash),
            object_count: count("object_count", digest.object_count),
            connection_count: count("connection_count", digest.connection_count),
            target: raw
                .get("target")
                .and_then(JsonValue::as_str)
                .and_then(|t| WorkspaceTarget::parse(t).ok())
                .unwrap_or(WorkspaceTarget::Active),
            context: raw.get("context").and_then(JsonValue::as_object).cloned().unwrap_or_default(),
            topology,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalWrite {
    pub saved: bool,
    pub path: PathBuf,
    pub count: usize,
}

#[derive(Serialize)]
struct JournalDocument<'a> {
    session_id: &'a str,
    updated_at: i64,
    checkpoints: &'a VecDeque<Checkpoint>,
}

/// Bounded, ordered checkpoint list backed by a JSON journal
#[derive(Debug)]
pub struct CheckpointJournal {
    path: PathBuf,
    session_id: String,
    max_entries: usize,
    entries: VecDeque<Checkpoint>,
}

impl CheckpointJournal {
    /// Load the journal at `path`. Missing or unreadable files give an empty journal.
    pub fn load(path: &Path, session_id: &str, max_entries: usize) -> Self {
        let mut journal = Self {
            path: path.to_path_buf(),
            session_id: session_id.to_string(),
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
        };
        if !path.exists() {
            return journal;
        }

        let document = match read_json(path) {
            Ok(document) => document,
            Err(e) => {
                tracing::warn!("Failed to load checkpoint journal {:?}: {}", path, e);
                return journal;
            }
        };
        let rows = document
            .get("checkpoints")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in rows.iter().filter_map(Checkpoint::from_journal_row) {
            journal.entries.retain(|e| e.checkpoint_id != entry.checkpoint_id);
            journal.entries.push_back(entry);
            journal.trim();
        }
        tracing::debug!("Loaded {} checkpoints from {:?}", journal.entries.len(), path);
        journal
    }

    fn trim(&mut self) {
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn push(&mut self, entry: Checkpoint) {
        self.entries.retain(|e| e.checkpoint_id != entry.checkpoint_id);
        self.entries.push_back(entry);
        self.trim();
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.entries.iter().find(|e| e.checkpoint_id == checkpoint_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Newest first
    pub fn summaries(&self) -> Vec<CheckpointSummary> {
        self.entries.iter().rev().map(Checkpoint::summary).collect()
    }

    pub fn save(&self) -> Result<JournalWrite> {
        let document = JournalDocument {
            session_id: &self.session_id,
            updated_at: chrono::Utc::now().timestamp(),
            checkpoints: &self.entries,
        };
        write_json_atomic(&self.path, &document)?;
        Ok(JournalWrite {
            saved: true,
            path: self.path.clone(),
            count: self.entries.len(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointCreated {
    pub checkpoint_id: String,
    pub label: String,
    pub created_at: f64,
    pub hash: String,
    pub object_count: usize,
    pub connection_count: usize,
    pub target: WorkspaceTarget,
    pub total_checkpoints: usize,
    pub checkpoint_journal: JournalWrite,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointRestored {
    pub checkpoint_id: String,
    pub applied: JsonValue,
    pub twin: TwinSyncReport,
}

impl RuntimeManager {
    /// Snapshot the current workspace into a new checkpoint.
    pub async fn create_checkpoint(&self, label: &str) -> Result<CheckpointCreated> {
        let target = self.active_target();
        if target == WorkspaceTarget::Host {
            return Err(self.host_blocked("create_checkpoint"));
        }
        if !self.bridge.is_connected() {
            return Err(Error::Bridge(
                BridgeError::new(
                    ErrorCode::BridgeUnavailable,
                    "Bridge is disconnected; cannot create checkpoint.",
                )
                .with_detail("target", target.as_str()),
            ));
        }

        let topology = self
            .capture_live_topology()
            .await
            .map_err(|e| self.bridge.operation_error("create_checkpoint", Some("get_objects_in_patch"), e))?;
        let context = self
            .bridge
            .send_request(json!({"action": "get_patcher_context"}), Some(CONTEXT_TIMEOUT), None)
            .await
            .map_err(|e| self.bridge.operation_error("create_checkpoint", Some("get_patcher_context"), e))?;

        let digest = topology.digest();
        let entry = Checkpoint {
            checkpoint_id: uuid::Uuid::new_v4().simple().to_string()[..10].to_string(),
            label: label.to_string(),
            created_at: now_epoch_secs(),
            hash: digest.hash.clone(),
            object_count: digest.object_count,
            connection_count: digest.connection_count,
            target,
            context: context.as_object().cloned().unwrap_or_default(),
            topology,
        };
        let checkpoint_id = entry.checkpoint_id.clone();
        let created_at = entry.created_at;

        let (journal_write, total) = {
            let mut journal = self.journal.lock();
            journal.push(entry);
            (journal.save(), journal.len())
        };
        let journal_write = journal_write
            .map_err(|e| self.bridge.operation_error("create_checkpoint", Some("checkpoint_journal_write"), e))?;

        tracing::info!("Created checkpoint {} ({} objects)", checkpoint_id, digest.object_count);
        Ok(CheckpointCreated {
            checkpoint_id,
            label: label.to_string(),
            created_at,
            hash: digest.hash,
            object_count: digest.object_count,
            connection_count: digest.connection_count,
            target,
            total_checkpoints: total,
            checkpoint_journal: journal_write,
        })
    }

    pub fn list_checkpoints(&self) -> Vec<CheckpointSummary> {
        self.journal.lock().summaries()
    }

    /// Apply a stored snapshot to the workspace and resync the twin.
    pub async fn restore_checkpoint(&self, checkpoint_id: &str) -> Result<CheckpointRestored> {
        if self.active_target() == WorkspaceTarget::Host {
            return Err(Error::Bridge(
                self.host_blocked("restore_checkpoint")
                    .into_bridge_error()
                    .with_detail("checkpoint_id", checkpoint_id),
            ));
        }
        let entry = self.journal.lock().get(checkpoint_id).cloned().ok_or_else(|| {
            Error::Bridge(
                BridgeError::new(
                    ErrorCode::ObjectNotFound,
                    format!("Checkpoint not found: {checkpoint_id}"),
                )
                .with_detail("checkpoint_id", checkpoint_id),
            )
        })?;
        if !self.bridge.is_connected() {
            return Err(Error::Bridge(
                BridgeError::new(
                    ErrorCode::BridgeUnavailable,
                    "Bridge is disconnected; cannot restore checkpoint.",
                )
                .with_detail("checkpoint_id", checkpoint_id),
            ));
        }

        let applied = self
            .bridge
            .send_request(
                json!({"action": "apply_topology_snapshot", "snapshot": entry.topology}),
                Some(RESTORE_TIMEOUT),
                None,
            )
            .await
            .map_err(|e| {
                let e = self.bridge.operation_error("restore_checkpoint", Some("apply_topology_snapshot"), e);
                Error::Bridge(e.into_bridge_error().with_detail("checkpoint_id", checkpoint_id))
            })?;
        let twin = self.sync_patch_twin(&format!("restore_checkpoint:{checkpoint_id}")).await;

        tracing::info!("Restored checkpoint {}", checkpoint_id);
        Ok(CheckpointRestored {
            checkpoint_id: checkpoint_id.to_string(),
            applied,
            twin,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_peer;

    #[tokio::test]
    async fn test_checkpoint_round_trip_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;

        runtime
            .bridge()
            .send_request(
                json!({"action": "add_object", "obj_type": "cycle~", "varname": "osc", "position": [0, 0]}),
                None,
                None,
            )
            .await
            .unwrap();
        let created = runtime.create_checkpoint("before").await.unwrap();
        assert_eq!(created.object_count, 1);
        assert_eq!(created.checkpoint_id.len(), 10);
        assert!(created.checkpoint_journal.path.exists());

        runtime
            .bridge()
            .send_request(json!({"action": "remove_object", "varname": "osc"}), None, None)
            .await
            .unwrap();
        assert_eq!(peer.box_count(), 0);

        let restored = runtime.restore_checkpoint(&created.checkpoint_id).await.unwrap();
        assert!(restored.twin.success);
        assert_eq!(peer.box_count(), 1);
        assert_eq!(restored.twin.hash.as_deref(), Some(created.hash.as_str()));

        // A second manager over the same session sees the journal
        let (reloaded, _peer) = runtime_with_peer(dir.path()).await;
        let listed = reloaded.list_checkpoints();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checkpoint_id, created.checkpoint_id);
        assert_eq!(listed[0].label, "before");
    }

    #[tokio::test]
    async fn test_restore_unknown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, _peer) = runtime_with_peer(dir.path()).await;
        let err = runtime.restore_checkpoint("missing").await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ObjectNotFound);
    }

    #[test]
    fn test_journal_trims_and_skips_invalid_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let rows: Vec<JsonValue> = (0..5)
            .map(|i| json!({"checkpoint_id": format!("cp{i}"), "topology": {"boxes": [], "lines": []}}))
            .chain([json!({"checkpoint_id": "", "topology": {}}), json!({"checkpoint_id": "x"})])
            .collect();
        std::fs::write(&path, json!({"session_id": "s", "checkpoints": rows}).to_string()).unwrap();

        let journal = CheckpointJournal::load(&path, "s", 3);
        let ids: Vec<String> = journal.summaries().into_iter().map(|s| s.checkpoint_id).collect();
        assert_eq!(ids, vec!["cp4", "cp3", "cp2"]);
    }

    #[test]
    fn test_corrupt_journal_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(CheckpointJournal::load(&path, "s", 20).is_empty());
    }
}
