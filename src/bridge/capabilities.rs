//! Peer capability negotiation

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use super::actions;
use crate::error::{BridgeError, ErrorCode};

/// What the peer advertised on its last `capabilities` reply
#[derive(Debug, Clone, Default, Serialize)]
pub struct Capabilities {
    pub supported_actions: BTreeSet<String>,
    pub supports_auth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_ping: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<f64>,
    /// Every other key the peer sent
    #[serde(flatten)]
    pub extras: Map<String, JsonValue>,
}

impl Capabilities {
    pub fn from_reply(reply: &JsonValue, health_ping: Option<JsonValue>) -> Self {
        let mut extras = reply.as_object().cloned().unwrap_or_default();

        let supported_actions = extras
            .remove("supported_actions")
            .and_then(|v| match v {
                JsonValue::Array(items) => Some(
                    items
                        .into_iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                ),
                _ => None,
            })
            .unwrap_or_default();
        let supports_auth = extras.remove("supports_auth").and_then(|v| v.as_bool());
        let protocol_version = extras
            .remove("protocol_version")
            .and_then(|v| v.as_str().map(str::to_string));

        Self {
            supported_actions,
            supports_auth,
            protocol_version,
            health_ping,
            fetched_at: Some(crate::utils::now_epoch_secs()),
            extras,
        }
    }

    /// True once a non-empty action list has been advertised.
    pub fn is_known(&self) -> bool {
        !self.supported_actions.is_empty()
    }

    pub fn supports(&self, action: &str) -> bool {
        !self.is_known() || self.supported_actions.contains(action)
    }

    /// Refuse `action` if the peer does not advertise it, or if a token is configured
    /// but the peer cannot authenticate.
    pub fn gate(&self, action: &str, token_configured: bool) -> Result<(), BridgeError> {
        if actions::is_ungated(action) {
            return Ok(());
        }
        if !self.supports(action) {
            return Err(BridgeError::new(
                ErrorCode::Precondition,
                format!("Bridge does not advertise required action '{action}'."),
            )
            .recoverable(false)
            .with_hint("Run get_bridge_diagnostics() and verify supported_actions.")
            .with_detail("action", action)
            .with_detail("supported_actions", self.actions_json()));
        }
        if token_configured && self.supports_auth == Some(false) {
            return Err(BridgeError::new(
                ErrorCode::Precondition,
                "Auth token configured but bridge does not support auth.",
            )
            .recoverable(false)
            .with_detail("auth_token_configured", true));
        }
        Ok(())
    }

    /// Check several actions at once, reporting every missing one.
    pub fn require_all(&self, operation: &str, required: &[&str]) -> Result<(), BridgeError> {
        if !self.is_known() {
            return Ok(());
        }
        let missing: Vec<JsonValue> = required
            .iter()
            .filter(|action| !self.supports(action))
            .map(|action| JsonValue::String(action.to_string()))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(BridgeError::new(
            ErrorCode::Precondition,
            format!("Bridge is missing actions required by {operation}."),
        )
        .recoverable(false)
        .with_hint("Run get_bridge_diagnostics() and verify supported_actions.")
        .with_detail("operation", operation)
        .with_detail("missing_actions", JsonValue::Array(missing))
        .with_detail("supported_actions", self.actions_json()))
    }

    fn actions_json(&self) -> JsonValue {
        JsonValue::Array(
            self.supported_actions
                .iter()
                .cloned()
                .map(JsonValue::String)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_gate_refuses_unadvertised_action() {
        let caps = Capabilities::from_reply(
            &json!({"supported_actions": ["add_object"], "supports_auth": true, "max_version": "9"}),
            None,
        );
        assert!(caps.gate("add_object", true).is_ok());
        assert!(caps.gate("health_ping", true).is_ok());

        let err = caps.gate("remove_object", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::Precondition);
        assert_eq!(err.details["supported_actions"], json!(["add_object"]));
        assert_eq!(caps.extras["max_version"], "9");
    }

    #[test]
    fn test_empty_capabilities_allow_everything() {
        let caps = Capabilities::default();
        assert!(caps.gate("remove_object", false).is_ok());
        assert!(caps.require_all("load", &["apply_topology_snapshot"]).is_ok());
    }

    #[test]
    fn test_token_without_peer_auth_support() {
        let caps = Capabilities::from_reply(
            &json!({"supported_actions": ["add_object"], "supports_auth": false}),
            None,
        );
        assert!(caps.gate("add_object", false).is_ok());
        assert_eq!(caps.gate("add_object", true).unwrap_err().code, ErrorCode::Precondition);
    }

    #[test]
    fn test_require_all_lists_missing() {
        let caps = Capabilities::from_reply(&json!({"supported_actions": ["get_objects_in_patch"]}), None);
        let err = caps
            .require_all("save_patch_to_path", &["get_objects_in_patch", "set_workspace_target"])
            .unwrap_err();
        assert_eq!(err.details["missing_actions"], json!(["set_workspace_target"]));
    }
}
