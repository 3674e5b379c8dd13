//! Patch twin: the bridge's hash-level belief about the live topology

use serde::Serialize;

use super::topology::TopologyDigest;
use super::RuntimeManager;
use crate::utils::now_epoch_secs;

#[derive(Debug, Clone, Default, Serialize)]
pub struct TwinState {
    pub baseline_hash: Option<String>,
    pub last_live_hash: Option<String>,
    pub last_sync_at: Option<f64>,
    pub last_check_at: Option<f64>,
    pub last_error: Option<String>,
    pub last_reason: Option<String>,
    pub baseline_object_count: usize,
    pub baseline_connection_count: usize,
    pub live_object_count: usize,
    pub live_connection_count: usize,
    pub last_drift: Option<bool>,
    pub auto_sync_enabled: bool,
}

impl TwinState {
    pub fn new(auto_sync_enabled: bool) -> Self {
        Self {
            auto_sync_enabled,
            ..Self::default()
        }
    }

    /// Make `digest` both the baseline and the last observed live state.
    pub fn apply_sync(&mut self, digest: &TopologyDigest, reason: &str, now: f64) {
        self.baseline_hash = Some(digest.hash.clone());
        self.last_live_hash = Some(digest.hash.clone());
        self.last_sync_at = Some(now);
        self.last_check_at = Some(now);
        self.last_error = None;
        self.last_reason = Some(reason.to_string());
        self.baseline_object_count = digest.object_count;
        self.baseline_connection_count = digest.connection_count;
        self.live_object_count = digest.object_count;
        self.live_connection_count = digest.connection_count;
        self.last_drift = Some(false);
    }

    /// Record a live observation. Returns `None` when this observation became the
    /// first baseline, otherwise whether live matches the baseline.
    pub fn apply_check(&mut self, digest: &TopologyDigest, now: f64) -> Option<bool> {
        self.last_live_hash = Some(digest.hash.clone());
        self.last_check_at = Some(now);
        self.live_object_count = digest.object_count;
        self.live_connection_count = digest.connection_count;
        self.last_error = None;

        match &self.baseline_hash {
            None => {
                self.baseline_hash = Some(digest.hash.clone());
                self.last_sync_at = Some(now);
                self.baseline_object_count = digest.object_count;
                self.baseline_connection_count = digest.connection_count;
                self.last_drift = Some(false);
                None
            }
            Some(baseline) => {
                let in_sync = *baseline == digest.hash;
                self.last_drift = Some(!in_sync);
                Some(in_sync)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TwinSyncReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_sync: Option<bool>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub twin: TwinState,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriftReport {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_sync: Option<bool>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub initialized: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline_connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_object_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_connection_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_resync: Option<TwinSyncReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub twin: TwinState,
}

impl DriftReport {
    fn failed(error: String, twin: TwinState) -> Self {
        Self {
            success: false,
            in_sync: None,
            initialized: false,
            baseline_hash: None,
            live_hash: None,
            baseline_object_count: None,
            baseline_connection_count: None,
            live_object_count: None,
            live_connection_count: None,
            auto_resync: None,
            error: Some(error),
            twin,
        }
    }
}

impl RuntimeManager {
    pub fn twin_status(&self) -> TwinState {
        self.twin.lock().clone()
    }

    /// Capture the live topology and make it the twin baseline.
    pub async fn sync_patch_twin(&self, reason: &str) -> TwinSyncReport {
        let failed = |error: String, twin: TwinState| TwinSyncReport {
            success: false,
            in_sync: None,
            reason: reason.to_string(),
            hash: None,
            object_count: None,
            connection_count: None,
            error: Some(error),
            twin,
        };

        if !self.bridge.is_connected() {
            return failed("bridge_disconnected".to_string(), self.twin_status());
        }

        match self.capture_live_topology().await {
            Ok(topology) => {
                let digest = topology.digest();
                let twin = {
                    let mut twin = self.twin.lock();
                    twin.apply_sync(&digest, reason, now_epoch_secs());
                    twin.clone()
                };
                tracing::debug!("Twin synced ({}): {}", reason, digest.hash);
                TwinSyncReport {
                    success: true,
                    in_sync: Some(true),
                    reason: reason.to_string(),
                    hash: Some(digest.hash),
                    object_count: Some(digest.object_count),
                    connection_count: Some(digest.connection_count),
                    error: None,
                    twin,
                }
            }
            Err(e) => {
                let twin = {
                    let mut twin = self.twin.lock();
                    twin.last_error = Some(e.to_string());
                    twin.clone()
                };
                tracing::warn!("Twin sync failed ({}): {}", reason, e);
                failed(e.to_string(), twin)
            }
        }
    }

    /// Compare the live topology against the twin baseline.
    pub async fn check_patch_drift(&self, auto_resync: bool) -> DriftReport {
        if !self.bridge.is_connected() {
            return DriftReport::failed("bridge_disconnected".to_string(), self.twin_status());
        }

        let topology = match self.capture_live_topology().await {
            Ok(topology) => topology,
            Err(e) => {
                let twin = {
                    let mut twin = self.twin.lock();
                    twin.last_error = Some(e.to_string());
                    twin.clone()
                };
                return DriftReport::failed(e.to_string(), twin);
            }
        };

        let digest = topology.digest();
        let (outcome, twin) = {
            let mut twin = self.twin.lock();
            let outcome = twin.apply_check(&digest, now_epoch_secs());
            (outcome, twin.clone())
        };

        let Some(in_sync) = outcome else {
            let mut report = DriftReport::failed(String::new(), twin);
            report.success = true;
            report.error = None;
            report.in_sync = Some(true);
            report.initialized = true;
            return report;
        };

        if !in_sync {
            tracing::info!(
                "Patch drift detected: baseline {:?} live {}",
                twin.baseline_hash,
                digest.hash
            );
        }
        let resync = if !in_sync && auto_resync {
            Some(self.sync_patch_twin("auto_resync_after_drift").await)
        } else {
            None
        };

        DriftReport {
            success: true,
            in_sync: Some(in_sync),
            initialized: false,
            baseline_hash: twin.baseline_hash.clone(),
            live_hash: Some(digest.hash),
            baseline_object_count: Some(twin.baseline_object_count),
            baseline_connection_count: Some(twin.baseline_connection_count),
            live_object_count: Some(digest.object_count),
            live_connection_count: Some(digest.connection_count),
            auto_resync: resync,
            error: None,
            twin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::runtime_with_peer;
    use serde_json::json;

    #[test]
    fn test_first_check_initializes_baseline() {
        let digest = TopologyDigest {
            hash: "abc".to_string(),
            object_count: 1,
            connection_count: 0,
        };
        let mut twin = TwinState::new(true);
        assert_eq!(twin.apply_check(&digest, 1.0), None);
        assert_eq!(twin.baseline_hash.as_deref(), Some("abc"));
        assert_eq!(twin.apply_check(&digest, 2.0), Some(true));
        assert_eq!(twin.last_drift, Some(false));
    }

    #[tokio::test]
    async fn test_drift_detection_with_auto_resync() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;

        let sync = runtime.sync_patch_twin("manual").await;
        assert!(sync.success);
        let baseline = sync.hash.clone().unwrap();

        // Change the peer behind the bridge's back
        peer.set_topology(&json!({
            "boxes": [{"box": {"varname": "stray", "maxclass": "newobj", "text": "noise~"}}],
            "lines": []
        }));

        let drift = runtime.check_patch_drift(false).await;
        assert_eq!(drift.in_sync, Some(false));
        assert_eq!(runtime.twin_status().baseline_hash.as_deref(), Some(baseline.as_str()));

        let drift = runtime.check_patch_drift(true).await;
        assert_eq!(drift.in_sync, Some(false));
        let resync = drift.auto_resync.unwrap();
        assert!(resync.success);
        assert_eq!(resync.reason, "auto_resync_after_drift");

        let drift = runtime.check_patch_drift(false).await;
        assert_eq!(drift.in_sync, Some(true));
        assert_ne!(drift.baseline_hash.unwrap(), baseline);
    }

    #[tokio::test]
    async fn test_sync_when_disconnected() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, peer) = runtime_with_peer(dir.path()).await;
        peer.kill();
        let report = runtime.sync_patch_twin("manual").await;
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("bridge_disconnected"));
    }
}
