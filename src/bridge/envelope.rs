//! Protocol v2 envelopes
//!
//! Outbound requests are wrapped in a [`RequestEnvelope`]; inbound `response` frames
//! are normalized by [`normalize_reply`] into either the peer's results or a
//! structured [`BridgeError`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{BridgeError, ErrorCode};

pub const PROTOCOL_VERSION: &str = "2.0";

/// Envelope fields that are never copied from the caller's payload
const RESERVED_FIELDS: &[&str] = &[
    "action",
    "request_id",
    "protocol_version",
    "state",
    "idempotency_key",
    "timestamp_ms",
];

/// Socket frame: `{"event": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Lifecycle state carried in every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeState {
    Requested,
    Accepted,
    Succeeded,
    Failed,
}

/// Outbound request
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    pub protocol_version: &'static str,
    pub request_id: String,
    pub state: EnvelopeState,
    pub action: String,
    pub payload: Map<String, JsonValue>,
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl RequestEnvelope {
    /// Wrap a caller payload. `payload` must already contain `action`.
    pub fn new(
        action: &str,
        caller: &Map<String, JsonValue>,
        auth_token: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Self {
        let payload = match caller.get("payload") {
            Some(JsonValue::Object(explicit)) => explicit.clone(),
            _ => caller
                .iter()
                .filter(|(k, _)| !RESERVED_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };

        Self {
            protocol_version: PROTOCOL_VERSION,
            request_id: uuid::Uuid::new_v4().to_string(),
            state: EnvelopeState::Requested,
            action: action.to_string(),
            payload,
            timestamp_ms: crate::utils::now_millis(),
            auth_token: auth_token.map(str::to_string),
            idempotency_key: idempotency_key.map(str::to_string),
        }
    }

    /// Wire form. Payload fields are mirrored at the top level for legacy handlers.
    pub fn to_json(&self) -> JsonValue {
        let mut map = match serde_json::to_value(self) {
            Ok(JsonValue::Object(map)) => map,
            _ => Map::new(),
        };
        for (key, value) in &self.payload {
            if !map.contains_key(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        if let Some(token) = &self.auth_token {
            map.insert("auth".to_string(), serde_json::json!({ "token": token }));
        }
        JsonValue::Object(map)
    }
}

/// Normalize a peer reply into its results or a structured error.
///
/// A reply without `state` or `protocol_version` is a legacy envelope: rejected when
/// `strict`, otherwise accepted as a success.
pub fn normalize_reply(raw: JsonValue, strict: bool) -> Result<JsonValue, BridgeError> {
    let mut map = match raw {
        JsonValue::Object(map) => map,
        other => {
            return Err(BridgeError::new(
                ErrorCode::Internal,
                "Bridge returned non-object response payload.",
            )
            .recoverable(false)
            .with_detail("payload_type", json_type_name(&other)))
        }
    };

    if !map.contains_key("state") || !map.contains_key("protocol_version") {
        if strict {
            let mut keys: Vec<JsonValue> = map.keys().cloned().map(JsonValue::String).collect();
            keys.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            return Err(BridgeError::new(
                ErrorCode::Precondition,
                "Legacy bridge response envelope rejected. Bridge must emit protocol v2 envelopes.",
            )
            .recoverable(false)
            .with_detail("received_keys", JsonValue::Array(keys)));
        }
        return Ok(map.remove("results").unwrap_or(JsonValue::Null));
    }

    match map.get("state").and_then(JsonValue::as_str) {
        Some("failed") => {
            let error = map.get("error").cloned().unwrap_or(JsonValue::Null);
            Err(BridgeError::from_peer(&error))
        }
        _ => Ok(map.remove("results").unwrap_or(JsonValue::Null)),
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_mirrors_payload() {
        let caller = json!({"action": "add_object", "varname": "osc1", "state": "spoofed"});
        let envelope = RequestEnvelope::new(
            "add_object",
            caller.as_object().unwrap(),
            Some("tok"),
            Some("k1"),
        );
        let wire = envelope.to_json();

        assert_eq!(wire["protocol_version"], "2.0");
        assert_eq!(wire["state"], "requested");
        assert_eq!(wire["payload"]["varname"], "osc1");
        assert!(wire["payload"].get("state").is_none());
        assert_eq!(wire["varname"], "osc1");
        assert_eq!(wire["auth_token"], "tok");
        assert_eq!(wire["auth"]["token"], "tok");
        assert_eq!(wire["idempotency_key"], "k1");
    }

    #[test]
    fn test_normalize_reply_states() {
        let ok = json!({"protocol_version": "2.0", "state": "succeeded", "results": {"n": 1}});
        assert_eq!(normalize_reply(ok, true).unwrap(), json!({"n": 1}));

        let failed = json!({
            "protocol_version": "2.0",
            "state": "failed",
            "error": {"code": "OBJECT_NOT_FOUND", "message": "no osc9", "recoverable": true}
        });
        let err = normalize_reply(failed, true).unwrap_err();
        assert_eq!(err.code, ErrorCode::ObjectNotFound);

        let legacy = json!({"results": [1, 2]});
        assert_eq!(
            normalize_reply(legacy.clone(), true).unwrap_err().code,
            ErrorCode::Precondition
        );
        assert_eq!(normalize_reply(legacy, false).unwrap(), json!([1, 2]));

        assert_eq!(
            normalize_reply(json!("nope"), false).unwrap_err().code,
            ErrorCode::Internal
        );
    }
}
