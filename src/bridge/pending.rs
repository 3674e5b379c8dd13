//! Pending request correlation
//!
//! Each in-flight request owns a [`PendingGuard`]. The entry is removed exactly once:
//! either by the reader task delivering a response, or by the guard being dropped
//! on timeout, error or cancellation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::sync::oneshot;

use crate::error::BridgeError;

/// Outcome delivered to a waiting request
pub type Delivery = std::result::Result<JsonValue, BridgeError>;

/// A request awaiting its response
pub struct PendingCall {
    tx: oneshot::Sender<Delivery>,
    pub action: String,
    pub created_at: Instant,
}

/// Map of request id to waiting caller
#[derive(Default, Clone)]
pub struct PendingCalls {
    inner: Arc<Mutex<HashMap<String, PendingCall>>>,
}

/// Removes its entry when dropped
pub struct PendingGuard {
    calls: PendingCalls,
    request_id: String,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the receiving half plus its guard.
    pub fn register(
        &self,
        request_id: &str,
        action: &str,
    ) -> (PendingGuard, oneshot::Receiver<Delivery>) {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(
            request_id.to_string(),
            PendingCall {
                tx,
                action: action.to_string(),
                created_at: Instant::now(),
            },
        );
        let guard = PendingGuard {
            calls: self.clone(),
            request_id: request_id.to_string(),
        };
        (guard, rx)
    }

    /// Deliver a response. Returns false for an unknown or already-resolved id.
    pub fn resolve(&self, request_id: &str, delivery: Delivery) -> bool {
        let call = self.inner.lock().remove(request_id);
        match call {
            Some(call) => {
                let _ = call.tx.send(delivery);
                true
            }
            None => {
                tracing::debug!("Dropping response for unknown request {}", request_id);
                false
            }
        }
    }

    /// Fail every waiting request, e.g. when the connection is lost.
    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let drained: Vec<PendingCall> = self.inner.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            tracing::debug!("Failing pending {} request: {}", call.action, error.message);
            let _ = call.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &str) {
        self.inner.lock().remove(request_id);
    }
}

impl PendingGuard {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.remove(&self.request_id);
    }
}
