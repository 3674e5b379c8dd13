//! Error types for the Max patch bridge
//!
//! Every failure that can reach the tool layer is expressed as a [`BridgeError`]
//! carrying a stable [`ErrorCode`], so callers branch on codes instead of message text.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

/// Stable error taxonomy shared by local rejections and peer-reported failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    #[serde(rename = "PRECONDITION_FAILED")]
    Precondition,
    #[serde(rename = "UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "BRIDGE_TIMEOUT")]
    BridgeTimeout,
    #[serde(rename = "BRIDGE_UNAVAILABLE")]
    BridgeUnavailable,
    #[serde(rename = "OVERLOADED")]
    Overloaded,
    #[serde(rename = "UNKNOWN_ACTION")]
    UnknownAction,
    #[serde(rename = "OBJECT_NOT_FOUND")]
    ObjectNotFound,
    #[serde(rename = "PROTECTED_OBJECT")]
    ProtectedObject,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::Precondition => "PRECONDITION_FAILED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::BridgeTimeout => "BRIDGE_TIMEOUT",
            ErrorCode::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
            ErrorCode::Overloaded => "OVERLOADED",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::ObjectNotFound => "OBJECT_NOT_FOUND",
            ErrorCode::ProtectedObject => "PROTECTED_OBJECT",
            ErrorCode::Internal => "INTERNAL_ERROR",
        }
    }

    /// Parse a code as sent by the peer. Short aliases are accepted.
    pub fn from_wire(code: &str) -> Option<Self> {
        let code = match code.trim().to_ascii_uppercase().as_str() {
            "VALIDATION_ERROR" | "VALIDATION" => ErrorCode::Validation,
            "PRECONDITION_FAILED" | "PRECONDITION" => ErrorCode::Precondition,
            "UNAUTHORIZED" => ErrorCode::Unauthorized,
            "BRIDGE_TIMEOUT" | "TIMEOUT" => ErrorCode::BridgeTimeout,
            "BRIDGE_UNAVAILABLE" => ErrorCode::BridgeUnavailable,
            "OVERLOADED" => ErrorCode::Overloaded,
            "UNKNOWN_ACTION" => ErrorCode::UnknownAction,
            "OBJECT_NOT_FOUND" => ErrorCode::ObjectNotFound,
            "PROTECTED_OBJECT" => ErrorCode::ProtectedObject,
            "INTERNAL_ERROR" | "INTERNAL" => ErrorCode::Internal,
            _ => return None,
        };
        Some(code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error as seen by the tool layer
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("{code}: {message}")]
pub struct BridgeError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub details: Map<String, JsonValue>,
}

impl BridgeError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: true,
            hint: None,
            details: Map::new(),
        }
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    /// Merge details without overwriting keys that are already present.
    pub fn merge_details(mut self, extra: Map<String, JsonValue>) -> Self {
        for (key, value) in extra {
            self.details.entry(key).or_insert(value);
        }
        self
    }

    /// Build from a peer `error` object. Unknown codes fold into `Internal`.
    pub fn from_peer(raw: &JsonValue) -> Self {
        let raw_code = raw.get("code").and_then(JsonValue::as_str).unwrap_or("INTERNAL_ERROR");
        let message = raw
            .get("message")
            .and_then(JsonValue::as_str)
            .unwrap_or("Bridge request failed.");
        let mut error = BridgeError::new(
            ErrorCode::from_wire(raw_code).unwrap_or(ErrorCode::Internal),
            message,
        )
        .recoverable(raw.get("recoverable").and_then(JsonValue::as_bool).unwrap_or(true));

        if let Some(hint) = raw.get("hint").and_then(JsonValue::as_str) {
            error.hint = Some(hint.to_string());
        }
        if let Some(details) = raw.get("details").and_then(JsonValue::as_object) {
            error.details = details.clone();
        }
        if ErrorCode::from_wire(raw_code).is_none() {
            error.details.insert("peer_code".to_string(), JsonValue::String(raw_code.to_string()));
        }
        error
    }
}

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    pub fn bridge(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Bridge(BridgeError::new(code, message))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Bridge(BridgeError::new(ErrorCode::Validation, message).recoverable(false))
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Error::Bridge(BridgeError::new(ErrorCode::Precondition, message).recoverable(false))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Bridge(e) => e.code,
            Error::Config(_) => ErrorCode::Validation,
            Error::Transport(_) => ErrorCode::BridgeUnavailable,
            Error::Io(_) | Error::Json(_) => ErrorCode::Internal,
        }
    }

    pub fn to_bridge_error(&self) -> BridgeError {
        match self {
            Error::Bridge(e) => e.clone(),
            other => BridgeError::new(other.code(), other.to_string()),
        }
    }

    pub fn into_bridge_error(self) -> BridgeError {
        match self {
            Error::Bridge(e) => e,
            other => other.to_bridge_error(),
        }
    }
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, Error>;

impl Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_bridge_error().serialize(serializer)
    }
}

/// Render an operation outcome as the `{success, ...}` shape the tool layer returns.
pub fn render<T: Serialize>(result: &Result<T>) -> JsonValue {
    let failure = |error: BridgeError| {
        serde_json::json!({
            "success": false,
            "error": error,
        })
    };

    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(JsonValue::Object(mut map)) => {
                map.entry("success").or_insert(JsonValue::Bool(true));
                JsonValue::Object(map)
            }
            Ok(other) => serde_json::json!({ "success": true, "result": other }),
            Err(e) => failure(Error::from(e).into_bridge_error()),
        },
        Err(e) => failure(e.to_bridge_error()),
    }
}
