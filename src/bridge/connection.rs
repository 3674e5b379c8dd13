//! Bridge connection
//!
//! Owns the transport and everything layered on top of it: request correlation,
//! idempotency, capability gating, mutation admission, auth and metrics. A single
//! router task per connection reads inbound frames and resolves pending requests.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::mpsc;

use super::actions;
use super::admission::{GateSnapshot, MutationGate};
use super::auth::ResolvedAuth;
use super::capabilities::Capabilities;
use super::envelope::{normalize_reply, Frame, RequestEnvelope};
use super::idempotency::IdempotencyCache;
use super::metrics::{BridgeMetrics, Level};
use super::pending::PendingCalls;
use super::transport::{Handshake, Transport};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorCode};
use crate::utils::{now_epoch_secs, redact_sensitive};
use crate::{Error, Result};

const CAPABILITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Hook invoked after every successful mutating request
#[async_trait]
pub trait ActionObserver: Send + Sync {
    async fn after_successful_action(&self, action: &str, payload: &Map<String, JsonValue>, results: &JsonValue);
}

#[derive(Default)]
struct LinkState {
    connected_at: Option<f64>,
    last_connect_error: Option<String>,
    auth_rejected: Option<String>,
    last_heartbeat_at: Option<f64>,
    last_heartbeat_error: Option<String>,
}

pub struct BridgeConnection {
    config: BridgeConfig,
    endpoint: String,
    transport: Arc<dyn Transport>,
    auth: ResolvedAuth,
    pending: PendingCalls,
    cache: IdempotencyCache,
    gate: MutationGate,
    metrics: BridgeMetrics,
    capabilities: RwLock<Capabilities>,
    observer: RwLock<Option<Weak<dyn ActionObserver>>>,
    link: Arc<Mutex<LinkState>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl BridgeConnection {
    pub fn new(config: &BridgeConfig, transport: Arc<dyn Transport>, auth: ResolvedAuth) -> Self {
        Self {
            endpoint: config.connection.endpoint(),
            transport,
            auth,
            pending: PendingCalls::new(),
            cache: IdempotencyCache::new(config.connection.idempotency_cache_size),
            gate: MutationGate::new(&config.admission),
            metrics: BridgeMetrics::new(&config.metrics),
            capabilities: RwLock::new(Capabilities::default()),
            observer: RwLock::new(None),
            link: Arc::new(Mutex::new(LinkState::default())),
            connect_lock: tokio::sync::Mutex::new(()),
            config: config.clone(),
        }
    }

    /// Register the after-action hook. Held weakly so the observer can own the connection.
    pub fn set_observer(&self, observer: Weak<dyn ActionObserver>) {
        *self.observer.write() = Some(observer);
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.read().clone()
    }

    pub fn gate_snapshot(&self) -> GateSnapshot {
        self.gate.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn auth_info(&self) -> JsonValue {
        self.auth.info()
    }

    pub fn metrics(&self) -> &BridgeMetrics {
        &self.metrics
    }

    fn strict_gating(&self) -> bool {
        self.config.connection.strict_capability_gating
    }

    fn auth_missing_error(&self) -> Error {
        Error::Bridge(
            BridgeError::new(
                ErrorCode::Precondition,
                "Handshake auth is required but no MAXBRIDGE_AUTH_TOKEN is configured. \
                 Set MAXBRIDGE_AUTH_TOKEN or MAXBRIDGE_AUTH_TOKEN_FILE.",
            )
            .recoverable(false)
            .with_detail("auth_required", true)
            .with_detail("auth_token_source", json!(self.auth.source))
            .with_detail("auth_token_file", self.auth.token_file.display().to_string()),
        )
    }

    /// Open the transport, start the router task and refresh capabilities.
    pub async fn connect(&self) -> Result<()> {
        let _serialized = self.connect_lock.lock().await;
        if self.transport.is_connected() {
            return Ok(());
        }
        if self.auth.required && self.auth.token.is_none() {
            return Err(self.auth_missing_error());
        }

        self.link.lock().auth_rejected = None;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let handshake = Handshake {
            endpoint: self.endpoint.clone(),
            auth_token: self.auth.token.clone(),
        };
        if let Err(e) = self.transport.connect(&handshake, inbound_tx).await {
            tracing::warn!("Bridge not reachable at {}: {}", self.endpoint, e);
            self.link.lock().last_connect_error = Some(e.to_string());
            return Err(e);
        }

        {
            let mut link = self.link.lock();
            link.connected_at = Some(now_epoch_secs());
            link.last_connect_error = None;
        }
        self.spawn_router(inbound_rx);

        if let Err(e) = self.fetch_capabilities().await {
            tracing::warn!("Capability refresh after connect failed: {}", e);
            self.link.lock().last_connect_error = Some(e.to_string());
        }

        let rejected = self.link.lock().auth_rejected.clone();
        if let Some(reason) = rejected {
            self.transport.disconnect().await;
            return Err(unauthorized(&self.endpoint, &reason));
        }
        Ok(())
    }

    fn spawn_router(&self, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        let pending = self.pending.clone();
        let link = self.link.clone();
        let transport = self.transport.clone();
        let strict = self.config.connection.strict_envelope;
        let endpoint = self.endpoint.clone();

        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame.event.as_str() {
                    "response" => {
                        let request_id = frame
                            .data
                            .get("request_id")
                            .and_then(JsonValue::as_str)
                            .map(str::to_string);
                        match request_id {
                            Some(id) => {
                                pending.resolve(&id, normalize_reply(frame.data, strict));
                            }
                            None => tracing::warn!("Bridge response without request_id ignored"),
                        }
                    }
                    "handshake_rejected" => {
                        let reason = frame
                            .data
                            .get("message")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("handshake rejected")
                            .to_string();
                        tracing::warn!("Bridge rejected handshake: {}", reason);
                        link.lock().auth_rejected = Some(reason.clone());
                        if let Error::Bridge(error) = unauthorized(&endpoint, &reason) {
                            pending.fail_all(&error);
                        }
                        transport.disconnect().await;
                        break;
                    }
                    other => tracing::debug!("Ignoring bridge event '{}'", other),
                }
            }

            let closed = BridgeError::new(ErrorCode::BridgeUnavailable, "Bridge connection closed.")
                .with_detail("endpoint", endpoint.as_str());
            let failed = pending.fail_all(&closed);
            if failed > 0 {
                tracing::warn!("Bridge connection closed with {} pending requests", failed);
            }
        });
    }

    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Connect if needed, with a bounded number of attempts.
    pub async fn ensure_connected(&self, retries: u32, retry_delay: Duration) -> Result<()> {
        if self.transport.is_connected() {
            return Ok(());
        }
        if self.auth.required && self.auth.token.is_none() {
            return Err(self.auth_missing_error());
        }

        for attempt in 0..=retries {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if matches!(e.code(), ErrorCode::Unauthorized | ErrorCode::Precondition) => {
                    return Err(e)
                }
                Err(_) => {}
            }
            if attempt < retries {
                tokio::time::sleep(retry_delay).await;
            }
        }

        let last_error = self.link.lock().last_connect_error.clone();
        let mut message = format!(
            "Max bridge unavailable at {}. Open Max and start the bridge patch, then retry.",
            self.endpoint
        );
        if let Some(last) = &last_error {
            message.push_str(&format!(" Last connect error: {last}"));
        }
        Err(Error::Bridge(
            BridgeError::new(ErrorCode::BridgeUnavailable, message)
                .with_detail("endpoint", self.endpoint.as_str())
                .with_detail("last_connect_error", json!(last_error)),
        ))
    }

    async fn ensure_connected_default(&self) -> Result<()> {
        self.ensure_connected(
            self.config.connection.connect_retries,
            Duration::from_millis(self.config.connection.connect_retry_delay_ms),
        )
        .await
    }

    /// Fire-and-forget command; no correlation and no admission.
    pub async fn send_command(&self, command: JsonValue) -> Result<()> {
        let (action, map) = validate_payload(command)?;
        self.ensure_connected_default().await?;
        let envelope = RequestEnvelope::new(&action, &map, self.auth.token.as_deref(), None);
        self.transport.emit(Frame::new("command", envelope.to_json())).await
    }

    /// Send a request and wait for its results.
    ///
    /// `timeout` defaults per action class. A repeated `idempotency_key` returns the
    /// cached result without contacting the peer.
    pub async fn send_request(
        &self,
        payload: JsonValue,
        timeout: Option<Duration>,
        idempotency_key: Option<&str>,
    ) -> Result<JsonValue> {
        let (action, map) = validate_payload(payload)?;
        self.metrics.note_attempt(&action);

        if let Some(key) = idempotency_key {
            if let Some(cached) = self.cache.get(key) {
                let mut details = Map::new();
                details.insert("idempotency_key".into(), json!(key));
                self.metrics.push_event(
                    Level::Info,
                    "IDEMPOTENCY_CACHE_HIT",
                    "Served request from idempotency cache.",
                    Some(&action),
                    None,
                    details,
                );
                return Ok(cached);
            }
        }

        self.ensure_connected_default().await?;

        if self.strict_gating() && !actions::is_ungated(&action) {
            if self.capabilities.read().fetched_at.is_none() {
                if let Err(e) = self.fetch_capabilities().await {
                    tracing::debug!("Lazy capability refresh failed: {}", e);
                }
            }
            let gated = self
                .capabilities
                .read()
                .gate(&action, self.auth.token.is_some());
            if let Err(e) = gated {
                self.metrics
                    .record_rejection(&action, Level::Warn, e.code.as_str(), &e.message, e.details.clone());
                return Err(e.into());
            }
        }

        let permit = if actions::is_mutating(&action) {
            match self.gate.acquire().await {
                Ok(permit) => Some(permit),
                Err(e) => {
                    self.metrics
                        .record_rejection(&action, Level::Warn, e.code.as_str(), &e.message, e.details.clone());
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        let queue_wait = permit.as_ref().map(|p| p.queue_wait()).unwrap_or_default();

        let timeout = timeout.unwrap_or_else(|| actions::default_timeout(&action));
        let results = self
            .dispatch(&action, &map, timeout, idempotency_key, queue_wait)
            .await?;

        if let Some(key) = idempotency_key {
            self.cache.put(key, results.clone());
        }
        drop(permit);

        if actions::is_mutating(&action) {
            let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
            if let Some(observer) = observer {
                observer.after_successful_action(&action, &map, &results).await;
            }
        }
        Ok(results)
    }

    /// Emit one request and wait for the correlated response. Does not connect,
    /// gate or admit; callers do that first.
    async fn dispatch(
        &self,
        action: &str,
        map: &Map<String, JsonValue>,
        timeout: Duration,
        idempotency_key: Option<&str>,
        queue_wait: Duration,
    ) -> Result<JsonValue> {
        let envelope = RequestEnvelope::new(action, map, self.auth.token.as_deref(), idempotency_key);
        let request_id = envelope.request_id.clone();
        let wire = envelope.to_json();
        let (guard, rx) = self.pending.register(&request_id, action);

        let started = Instant::now();
        if let Err(e) = self.transport.emit(Frame::new("request", wire.clone())).await {
            let message = format!("Bridge request transport failure: {e}");
            self.metrics
                .record_rejection(action, Level::Error, ErrorCode::BridgeUnavailable.as_str(), &message, Map::new());
            return Err(Error::Bridge(
                BridgeError::new(ErrorCode::BridgeUnavailable, message)
                    .with_hint("Verify bridge connectivity and retry.")
                    .with_detail("action", action),
            ));
        }
        self.metrics.note_emitted();
        tracing::debug!("Request to bridge: {}", redact_sensitive(&wire));

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(Ok(results))) => {
                self.metrics.record_success(action, elapsed, queue_wait);
                Ok(results)
            }
            Ok(Ok(Err(error))) => {
                self.metrics.record_failure(
                    action,
                    elapsed,
                    queue_wait,
                    error.code.as_str(),
                    &error.message,
                    Some(&request_id),
                    error.details.clone(),
                );
                Err(error.into())
            }
            Ok(Err(_)) => {
                let message = "Bridge response channel closed.";
                self.metrics
                    .record_rejection(action, Level::Error, ErrorCode::BridgeUnavailable.as_str(), message, Map::new());
                Err(Error::bridge(ErrorCode::BridgeUnavailable, message))
            }
            Err(_) => {
                let secs = timeout.as_secs_f64();
                let message = format!("No response received in {secs} seconds.");
                self.metrics
                    .record_timeout(action, elapsed, queue_wait, &request_id, &message);
                Err(Error::Bridge(
                    BridgeError::new(ErrorCode::BridgeTimeout, message)
                        .with_hint("Check bridge health and retry with a higher timeout for large patches.")
                        .with_detail("action", action)
                        .with_detail("timeout_seconds", secs),
                ))
            }
        }
    }

    /// Reconnect if needed and re-read the peer's capabilities.
    pub async fn refresh_capabilities(&self) -> Result<Capabilities> {
        self.ensure_connected_default().await?;
        self.fetch_capabilities().await
    }

    async fn fetch_capabilities(&self) -> Result<Capabilities> {
        let request = |action: &str| {
            let mut map = Map::new();
            map.insert("action".into(), json!(action));
            map
        };
        let reply = self
            .dispatch("capabilities", &request("capabilities"), CAPABILITY_TIMEOUT, None, Duration::ZERO)
            .await?;
        let health = self
            .dispatch("health_ping", &request("health_ping"), CAPABILITY_TIMEOUT, None, Duration::ZERO)
            .await
            .ok();

        let capabilities = Capabilities::from_reply(&reply, health);
        *self.capabilities.write() = capabilities.clone();
        tracing::debug!(
            "Bridge advertises {} actions",
            capabilities.supported_actions.len()
        );
        Ok(capabilities)
    }

    /// Heartbeat probe
    pub async fn ping_bridge(&self, timeout: Duration) -> JsonValue {
        match self
            .send_request(json!({"action": "health_ping"}), Some(timeout), None)
            .await
        {
            Ok(response) => {
                let mut link = self.link.lock();
                link.last_heartbeat_at = Some(now_epoch_secs());
                link.last_heartbeat_error = None;
                json!({"ok": true, "response": response})
            }
            Err(e) => {
                self.link.lock().last_heartbeat_error = Some(e.to_string());
                json!({"ok": false, "error": e.to_string()})
            }
        }
    }

    pub fn health_snapshot(&self) -> JsonValue {
        let now = now_epoch_secs();
        let timeline = self.metrics.timeline();
        let totals = self.metrics.totals();
        let gate = self.gate.snapshot();
        let capabilities = self.capabilities();
        let link = self.link.lock();

        let response_age = timeline.last_response_at.map(|t| ((now - t) * 1000.0).round() / 1000.0);
        let request_age = timeline.last_request_at.map(|t| ((now - t) * 1000.0).round() / 1000.0);
        let stale = response_age
            .map(|age| age > self.config.connection.stale_threshold_secs)
            .unwrap_or(true);

        json!({
            "protocol_version": super::envelope::PROTOCOL_VERSION,
            "connected": self.transport.is_connected(),
            "endpoint": self.endpoint,
            "stale": stale,
            "response_age_seconds": response_age,
            "request_age_seconds": request_age,
            "stale_threshold_seconds": self.config.connection.stale_threshold_secs,
            "connected_at": link.connected_at,
            "timeline": timeline,
            "last_heartbeat_at": link.last_heartbeat_at,
            "last_heartbeat_error": link.last_heartbeat_error,
            "last_connect_error": link.last_connect_error,
            "totals": totals,
            "mutation_queue": gate,
            "pending_requests": self.pending.len(),
            "auth": self.auth.info(),
            "capabilities": capabilities,
        })
    }

    pub fn metrics_snapshot(&self, include_events: bool, event_limit: usize) -> JsonValue {
        self.metrics
            .snapshot(&self.gate.snapshot(), include_events, event_limit)
    }

    pub fn emit_metrics_log(&self, force: bool) -> Option<JsonValue> {
        self.metrics.emit_log(
            &self.gate.snapshot(),
            &self.endpoint,
            self.transport.is_connected(),
            force,
        )
    }

    /// Attach operation context to a failed inner call.
    pub fn operation_error(&self, operation: &str, action: Option<&str>, error: Error) -> Error {
        let mut context = Map::new();
        if let Some(action) = action {
            context.insert("action".into(), json!(action));
        }
        context.insert("operation".into(), json!(operation));
        context.insert("endpoint".into(), json!(self.endpoint));
        context.insert("mutation_queue".into(), json!(self.gate.snapshot()));

        let mut bridge = error.into_bridge_error().merge_details(context);
        if bridge.hint.is_none() {
            bridge.hint = match bridge.code {
                ErrorCode::Overloaded => Some(
                    "Bridge mutation queue is saturated. Retry after in-flight operations complete \
                     or raise MAXBRIDGE_MUTATION_MAX_QUEUE/MAXBRIDGE_MUTATION_MAX_INFLIGHT."
                        .to_string(),
                ),
                ErrorCode::Unauthorized => {
                    Some("Verify MAXBRIDGE_AUTH_TOKEN matches bridge configuration and retry.".to_string())
                }
                ErrorCode::Precondition => Some(
                    "Run get_bridge_diagnostics() to verify bridge capabilities and runtime prerequisites."
                        .to_string(),
                ),
                _ => None,
            };
        }
        Error::Bridge(bridge)
    }
}

fn unauthorized(endpoint: &str, reason: &str) -> Error {
    Error::Bridge(
        BridgeError::new(
            ErrorCode::Unauthorized,
            format!("Bridge at {endpoint} rejected the handshake: {reason}"),
        )
        .recoverable(false)
        .with_hint("Verify MAXBRIDGE_AUTH_TOKEN matches bridge configuration and retry.")
        .with_detail("endpoint", endpoint),
    )
}

fn validate_payload(payload: JsonValue) -> Result<(String, Map<String, JsonValue>)> {
    let JsonValue::Object(map) = payload else {
        return Err(Error::validation("Bridge request payload must be a JSON object."));
    };
    let action = map
        .get("action")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::validation("Bridge request payload must include an 'action'."))?;
    Ok((action, map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{connected_bridge, test_config, FakePeer};

    #[tokio::test]
    async fn test_request_round_trip_and_envelope() {
        let (bridge, peer) = connected_bridge(test_config()).await;
        let results = bridge
            .send_request(json!({"action": "get_patcher_context"}), None, None)
            .await
            .unwrap();
        assert_eq!(results["name"], "fake");

        let sent = peer.last_request("get_patcher_context").unwrap();
        assert_eq!(sent["protocol_version"], "2.0");
        assert_eq!(sent["state"], "requested");
        assert_eq!(sent["auth_token"], "test-token");
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let (bridge, _peer) = connected_bridge(test_config()).await;
        let err = bridge.send_request(json!([1, 2]), None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        let err = bridge.send_request(json!({"action": ""}), None, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
    }

    #[tokio::test]
    async fn test_idempotency_key_skips_peer() {
        let (bridge, peer) = connected_bridge(test_config()).await;
        let payload = json!({"action": "add_object", "obj_type": "cycle~", "varname": "osc1", "position": [10, 10]});

        let first = bridge
            .send_request(payload.clone(), None, Some("tx-1:0"))
            .await
            .unwrap();
        let sent_before = peer.count("add_object");
        let second = bridge.send_request(payload, None, Some("tx-1:0")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(peer.count("add_object"), sent_before);
        assert_eq!(peer.box_count(), 1);
    }

    #[tokio::test]
    async fn test_capability_gating_blocks_before_emit() {
        let peer = FakePeer::with_actions(&["add_object", "get_objects_in_patch"]);
        let (bridge, peer) = crate::testing::connect_with_peer(test_config(), peer).await;

        let err = bridge
            .send_request(json!({"action": "remove_object", "varname": "x"}), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Precondition);
        assert_eq!(peer.count("remove_object"), 0);
        assert_eq!(bridge.gate_snapshot().admitted, 0);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_residue() {
        let (bridge, peer) = connected_bridge(test_config()).await;
        peer.drop_action("add_object");

        let err = bridge
            .send_request(
                json!({"action": "add_object", "varname": "slow"}),
                Some(Duration::from_millis(40)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BridgeTimeout);
        assert_eq!(bridge.pending_count(), 0);
        let gate = bridge.gate_snapshot();
        assert_eq!(gate.inflight, 0);
        assert_eq!(gate.queued, 0);
        assert_eq!(bridge.metrics().totals().total_timeouts, 1);
    }

    #[tokio::test]
    async fn test_peer_failure_is_structured() {
        let (bridge, peer) = connected_bridge(test_config()).await;
        peer.fail_action("remove_object", "OBJECT_NOT_FOUND", "No object 'ghost'.");

        let err = bridge
            .send_request(json!({"action": "remove_object", "varname": "ghost"}), None, None)
            .await
            .unwrap_err();
        let bridge_error = err.to_bridge_error();
        assert_eq!(bridge_error.code, ErrorCode::ObjectNotFound);
        assert_eq!(bridge_error.message, "No object 'ghost'.");
        assert_eq!(bridge.metrics_snapshot(false, 0)["total_failures"], 1);
    }

    #[tokio::test]
    async fn test_missing_token_refuses_connection() {
        let mut config = test_config();
        config.auth.require_handshake_auth = true;
        let peer = FakePeer::new();
        let auth = ResolvedAuth {
            token: None,
            source: crate::bridge::auth::TokenSource::None,
            token_file: config.token_file(),
            required: true,
        };
        let bridge = BridgeConnection::new(&config, peer.clone(), auth);

        let err = bridge
            .send_request(json!({"action": "get_objects_in_patch"}), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Precondition);
        assert!(!peer.is_connected());
    }

    #[tokio::test]
    async fn test_handshake_rejection_is_unauthorized() {
        let peer = FakePeer::new();
        peer.reject_handshake();
        let bridge = BridgeConnection::new(&test_config(), peer.clone(), crate::testing::test_auth());

        let err = bridge.connect().await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
        assert!(!bridge.is_connected());
    }

    #[tokio::test]
    async fn test_operation_error_adds_context() {
        let (bridge, _peer) = connected_bridge(test_config()).await;
        let err = bridge.operation_error(
            "restore_checkpoint",
            Some("apply_topology_snapshot"),
            Error::bridge(ErrorCode::Overloaded, "full"),
        );
        let bridge_error = err.to_bridge_error();
        assert_eq!(bridge_error.details["operation"], "restore_checkpoint");
        assert_eq!(bridge_error.details["action"], "apply_topology_snapshot");
        assert!(bridge_error.details.contains_key("mutation_queue"));
        assert!(bridge_error.hint.unwrap().contains("MUTATION_MAX_QUEUE"));
    }

    #[tokio::test]
    async fn test_health_snapshot_hides_token() {
        let (bridge, _peer) = connected_bridge(test_config()).await;
        bridge.ping_bridge(Duration::from_secs(1)).await;
        let health = bridge.health_snapshot();
        assert_eq!(health["connected"], true);
        assert_eq!(health["stale"], false);
        assert_eq!(health["auth"]["configured"], true);
        assert!(!health.to_string().contains("test-token"));
    }

    #[tokio::test]
    async fn test_sixty_concurrent_mutations_drain_cleanly() {
        let mut config = test_config();
        config.admission.max_inflight = 3;
        config.admission.max_queue = 12;
        config.admission.queue_wait_timeout_ms = 1_000;
        let (bridge, peer) = connected_bridge(config).await;
        peer.set_delay("add_object", Duration::from_millis(10));

        let calls: Vec<_> = (0..60)
            .map(|i| {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge
                        .send_request(
                            json!({"action": "add_object", "obj_type": "toggle", "varname": format!("soak_{i}")}),
                            None,
                            None,
                        )
                        .await
                })
            })
            .collect();

        let mut succeeded = 0;
        let mut overloaded = 0;
        for call in futures::future::join_all(calls).await {
            match call.unwrap() {
                Ok(_) => succeeded += 1,
                Err(e) if e.code() == ErrorCode::Overloaded => overloaded += 1,
                Err(e) => panic!("unexpected failure: {e}"),
            }
        }

        assert!(succeeded > 0);
        assert!(overloaded > 0);
        assert_eq!(succeeded + overloaded, 60);
        assert_eq!(peer.box_count(), succeeded);

        let gate = bridge.gate_snapshot();
        assert_eq!(gate.inflight, 0);
        assert_eq!(gate.queued, 0);
        assert!(gate.max_depth_seen > 0);
        assert_eq!(bridge.pending_count(), 0);
    }
}
