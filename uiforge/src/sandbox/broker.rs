//! Capability-scoped API broker
//!
//! Trusted peer of one isolated context. The binding list frozen by the
//! pipeline is the whole whitelist: a request is fulfilled only if its ref is
//! bound and its method matches the binding's type. Every well-formed request
//! from the owned context gets exactly one response; one request maps to at
//! most one host call, with no retries.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::host_client::{HostClient, HostRequest, HostResponse};
use super::isolate::IsolatedContext;
use super::messages::{ApiResponse, ContextId, Envelope, SandboxErrorReport, SandboxMessage};
use crate::references::{ApiBinding, CallKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Unknown API reference: {0}")]
    UnknownReference(String),

    #[error("API reference '{reference}' is a {bound}, not a {requested}")]
    TypeMismatch {
        reference: String,
        bound: CallKind,
        requested: CallKind,
    },

    #[error("Unsupported API method '{method}' for reference '{reference}'")]
    UnsupportedMethod { reference: String, method: String },

    /// A substituted `:name` segment would leave the bound path.
    #[error("Invalid value for path parameter '{param}' of API reference '{reference}'")]
    InvalidPathParam { reference: String, param: String },

    /// Non-success host response
    #[error("{0}")]
    Host(String),

    #[error("{0}")]
    Transport(String),
}

/// A request that passed the shape checks.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundRequest {
    pub id: String,
    pub reference: String,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub data: Option<Value>,
}

impl InboundRequest {
    /// `None` for anything that is not an `api-request` with a non-empty
    /// string `id` and `ref`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        if payload.get("kind").and_then(Value::as_str) != Some("api-request") {
            return None;
        }
        let id = non_empty_str(payload, "id")?;
        let reference = non_empty_str(payload, "ref")?;
        Some(Self {
            id,
            reference,
            method: payload
                .get("method")
                .and_then(Value::as_str)
                .map(String::from),
            params: payload.get("params").filter(|v| !v.is_null()).cloned(),
            data: payload.get("data").filter(|v| !v.is_null()).cloned(),
        })
    }
}

fn non_empty_str(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

pub struct ApiBroker {
    context: ContextId,
    bindings: HashMap<String, ApiBinding>,
    host: Arc<dyn HostClient>,
}

impl std::fmt::Debug for ApiBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiBroker")
            .field("context", &self.context)
            .field("bindings", &self.bindings.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ApiBroker {
    pub fn new(context: ContextId, bindings: &[ApiBinding], host: Arc<dyn HostClient>) -> Self {
        let bindings = bindings
            .iter()
            .map(|binding| (binding.reference.clone(), binding.clone()))
            .collect();
        Self {
            context,
            bindings,
            host,
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Handle one envelope. `None` means the message was ignored: foreign
    /// origin, not a request, or missing `id`/`ref`.
    pub async fn handle_envelope(&self, envelope: &Envelope) -> Option<ApiResponse> {
        if envelope.source != self.context {
            log::warn!(
                "Ignoring message from context {} (broker owns {})",
                envelope.source,
                self.context
            );
            return None;
        }
        let Some(request) = InboundRequest::from_payload(&envelope.payload) else {
            log::debug!("Ignoring malformed message from {}", self.context);
            return None;
        };
        Some(self.handle_request(request).await)
    }

    pub async fn handle_request(&self, request: InboundRequest) -> ApiResponse {
        let id = request.id.clone();
        match self.dispatch(request).await {
            Ok(data) => ApiResponse::success(id, data),
            Err(e) => {
                log::info!("Rejected sandbox request {}: {}", id, e);
                ApiResponse::failure(id, e.to_string())
            }
        }
    }

    async fn dispatch(&self, request: InboundRequest) -> Result<Value, BrokerError> {
        let binding = self
            .bindings
            .get(&request.reference)
            .ok_or_else(|| BrokerError::UnknownReference(request.reference.clone()))?;

        let requested = match request.method.as_deref() {
            Some("query") => CallKind::Query,
            Some("action") => CallKind::Action,
            other => {
                return Err(BrokerError::UnsupportedMethod {
                    reference: request.reference.clone(),
                    method: other.unwrap_or_default().to_string(),
                })
            }
        };
        if requested != binding.kind {
            return Err(BrokerError::TypeMismatch {
                reference: request.reference.clone(),
                bound: binding.kind,
                requested,
            });
        }

        let host_request = build_host_request(binding, request.params, request.data)?;
        log::debug!(
            "Forwarding {} '{}' as {} {}",
            binding.kind,
            binding.reference,
            host_request.method,
            host_request.path
        );
        let response = self
            .host
            .send(host_request)
            .await
            .map_err(BrokerError::Transport)?;

        if response.is_success() {
            Ok(response.body)
        } else {
            Err(BrokerError::Host(host_error_text(&response)))
        }
    }

    /// Serve requests arriving on `inbox` until it closes. Requests run
    /// concurrently; error reports are forwarded to `errors`. Aborting the
    /// returned future's task drops every in-flight host call.
    pub async fn listen(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        context: Arc<dyn IsolatedContext>,
        errors: mpsc::UnboundedSender<SandboxErrorReport>,
    ) {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    if envelope.source == self.context
                        && envelope.payload.get("kind").and_then(Value::as_str) == Some("sandbox-error")
                    {
                        if let Ok(SandboxMessage::SandboxError(report)) =
                            serde_json::from_value(envelope.payload)
                        {
                            log::warn!("Sandbox {} reported: {}", self.context, report.message);
                            let _ = errors.send(report);
                        }
                        continue;
                    }
                    let broker = Arc::clone(&self);
                    let context = Arc::clone(&context);
                    in_flight.spawn(async move {
                        if let Some(response) = broker.handle_envelope(&envelope).await {
                            if !context.post(SandboxMessage::ApiResponse(response)) {
                                log::debug!("Context {} no longer accepts responses", broker.context);
                            }
                        }
                    });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }
        while in_flight.join_next().await.is_some() {}
        log::debug!("Broker for {} stopped", self.context);
    }
}

/// Query bindings become `GET path?params`; everything else sends the
/// payload (data, else params) as a JSON body with the declared method.
/// `:name` path segments are filled from the same source. A value that is
/// empty, `.` or `..` is rejected so the final URL cannot resolve outside
/// the bound path.
pub fn build_host_request(
    binding: &ApiBinding,
    params: Option<Value>,
    data: Option<Value>,
) -> Result<HostRequest, BrokerError> {
    let invalid = |param: String| BrokerError::InvalidPathParam {
        reference: binding.reference.clone(),
        param,
    };
    match binding.kind {
        CallKind::Query => {
            let mut fields = match params {
                Some(Value::Object(fields)) => fields,
                _ => Map::new(),
            };
            let path = fill_path_params(&binding.resolved.path, |name| fields.remove(name))
                .map_err(invalid)?;
            let query: String = {
                let mut serializer = url::form_urlencoded::Serializer::new(String::new());
                for (key, value) in &fields {
                    if let Some(value) = query_value(value) {
                        serializer.append_pair(key, &value);
                    }
                }
                serializer.finish()
            };
            Ok(HostRequest {
                method: "GET".to_string(),
                path: if query.is_empty() {
                    path
                } else {
                    format!("{}?{}", path, query)
                },
                body: None,
            })
        }
        CallKind::Action => {
            let body = data.or(params);
            let path = fill_path_params(&binding.resolved.path, |name| {
                body.as_ref().and_then(|b| b.get(name)).cloned()
            })
            .map_err(invalid)?;
            Ok(HostRequest {
                method: binding.resolved.method.clone(),
                path,
                body,
            })
        }
    }
}

/// Fills `:name` segments. `Err` carries the name whose value is not a
/// plain segment.
fn fill_path_params<F>(path: &str, mut lookup: F) -> Result<String, String>
where
    F: FnMut(&str) -> Option<Value>,
{
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment.strip_prefix(':') {
            Some(name) if !name.is_empty() => match lookup(name).as_ref().and_then(query_value) {
                Some(value) if matches!(value.as_str(), "" | "." | "..") => {
                    return Err(name.to_string())
                }
                Some(value) => segments.push(encode_segment(&value)),
                None => segments.push(segment.to_string()),
            },
            _ => segments.push(segment.to_string()),
        }
    }
    Ok(segments.join("/"))
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(_) | Value::Number(_) => Some(value.to_string()),
        other => Some(other.to_string()),
    }
}

fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn host_error_text(response: &HostResponse) -> String {
    let from_body = match &response.body {
        Value::Object(body) => body
            .get("error")
            .and_then(|e| e.as_str().or_else(|| e.get("message").and_then(Value::as_str)))
            .or_else(|| body.get("message").and_then(Value::as_str))
            .map(String::from),
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        _ => None,
    };
    from_body.unwrap_or_else(|| format!("Request failed ({})", response.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::references::ResolvedEndpoint;
    use serde_json::json;

    fn binding(kind: CallKind, reference: &str, method: &str, path: &str) -> ApiBinding {
        ApiBinding {
            kind,
            reference: reference.to_string(),
            resolved: ResolvedEndpoint {
                method: method.to_string(),
                path: path.to_string(),
            },
        }
    }

    #[test]
    fn query_params_become_query_string() {
        let list = binding(CallKind::Query, "listTasks", "GET", "/api/tasks");
        let request = build_host_request(&list, Some(json!({"status": "todo"})), None).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/api/tasks?status=todo");
        assert_eq!(request.body, None);

        let bare = build_host_request(&list, None, None).unwrap();
        assert_eq!(bare.path, "/api/tasks");
    }

    #[test]
    fn path_params_are_substituted_once() {
        let get = binding(CallKind::Query, "getTask", "GET", "/api/tasks/:id");
        let request = build_host_request(&get, Some(json!({"id": 42, "expand": true})), None).unwrap();
        assert_eq!(request.path, "/api/tasks/42?expand=true");

        let spaced = build_host_request(&get, Some(json!({"id": "a b"})), None).unwrap();
        assert_eq!(spaced.path, "/api/tasks/a%20b");
    }

    #[test]
    fn action_prefers_data_over_params() {
        let update = binding(CallKind::Action, "updateTask", "PATCH", "/api/tasks/:id");
        let request = build_host_request(
            &update,
            Some(json!({"ignored": true})),
            Some(json!({"id": "t1", "title": "x"})),
        )
        .unwrap();
        assert_eq!(request.method, "PATCH");
        assert_eq!(request.path, "/api/tasks/t1");
        assert_eq!(request.body, Some(json!({"id": "t1", "title": "x"})));

        let fallback = build_host_request(&update, Some(json!({"id": "t2"})), None).unwrap();
        assert_eq!(fallback.body, Some(json!({"id": "t2"})));
    }

    #[test]
    fn dot_segments_are_rejected() {
        let get = binding(CallKind::Query, "getTask", "GET", "/api/tasks/:id");
        for value in ["..", ".", ""] {
            assert_eq!(
                build_host_request(&get, Some(json!({ "id": value })), None),
                Err(BrokerError::InvalidPathParam {
                    reference: "getTask".to_string(),
                    param: "id".to_string(),
                })
            );
        }

        let delete = binding(
            CallKind::Action,
            "deleteComment",
            "DELETE",
            "/api/posts/:postId/comments/:id",
        );
        let escaped = build_host_request(&delete, None, Some(json!({"postId": "..", "id": "x"})));
        assert!(matches!(
            escaped,
            Err(BrokerError::InvalidPathParam { ref param, .. }) if param == "postId"
        ));

        // dots inside a value and encoded dots stay inside one segment
        let dotted = build_host_request(&get, Some(json!({"id": "v1.2"})), None).unwrap();
        assert_eq!(dotted.path, "/api/tasks/v1.2");
        let encoded = build_host_request(&get, Some(json!({"id": "%2e%2e"})), None).unwrap();
        assert_eq!(encoded.path, "/api/tasks/%252e%252e");
        let slashed = build_host_request(&get, Some(json!({"id": "../x"})), None).unwrap();
        assert_eq!(slashed.path, "/api/tasks/..%2Fx");
    }

    #[test]
    fn host_error_text_prefers_body() {
        let with_error = HostResponse {
            status: 422,
            body: json!({"error": "title is required"}),
        };
        assert_eq!(host_error_text(&with_error), "title is required");

        let nested = HostResponse {
            status: 400,
            body: json!({"error": {"message": "bad input"}}),
        };
        assert_eq!(host_error_text(&nested), "bad input");

        let bare = HostResponse {
            status: 503,
            body: Value::Null,
        };
        assert_eq!(host_error_text(&bare), "Request failed (503)");
    }

    #[test]
    fn malformed_payloads_are_not_requests() {
        assert!(InboundRequest::from_payload(&json!({"kind": "api-request", "ref": "x"})).is_none());
        assert!(InboundRequest::from_payload(&json!({"kind": "api-request", "id": "1"})).is_none());
        assert!(InboundRequest::from_payload(&json!({"kind": "api-request", "id": "", "ref": "x"})).is_none());
        assert!(InboundRequest::from_payload(&json!({"kind": "api-response", "id": "1", "ref": "x"})).is_none());
        assert!(InboundRequest::from_payload(&json!("api-request")).is_none());
    }
}
