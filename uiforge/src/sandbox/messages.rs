//! Sandbox ↔ broker message schema.
//!
//! Messages are transport-agnostic JSON objects discriminated by `kind`.
//! Whatever carries them wraps each outbound message in an [`Envelope`]
//! stamped with the [`ContextId`] of the isolate that produced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::references::CallKind;

/// Identity of one isolated context instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SandboxMessage {
    ApiRequest(ApiRequest),
    ApiResponse(ApiResponse),
    SandboxError(SandboxErrorReport),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiRequest {
    pub id: String,
    pub method: CallKind,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Answer to one [`ApiRequest`]. Exactly one of `data`/`error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ApiResponse {
    pub fn success(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(error.into()),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Uncaught failure inside an isolate. Never an API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxErrorReport {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,
}

impl SandboxErrorReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
            col: None,
        }
    }
}

/// An outbound message as seen by the trusted side. `payload` is kept raw so
/// malformed messages can be inspected and dropped instead of failing decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub source: ContextId,
    pub payload: Value,
}

impl Envelope {
    pub fn new(source: ContextId, message: &SandboxMessage) -> Self {
        Self {
            source,
            payload: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }
}
