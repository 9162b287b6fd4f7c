//! Guest-side bridge
//!
//! The only surface generated code gets for reaching the host: `query` and
//! `action`. Each call registers a pending record keyed by a fresh request id,
//! posts an `api-request` through the context's single outlet and waits for
//! the matching `api-response`, bounded by [`REQUEST_TIMEOUT`].
//!
//! [`BRIDGE_SCRIPT`] is the same contract for script interpreters; it is
//! injected ahead of generated code by the process launcher.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::messages::{ApiRequest, ApiResponse, ContextId, Envelope, SandboxMessage};
use crate::references::CallKind;

/// Fixed bound on every sandbox-originated request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge prelude for JavaScript guests.
pub const BRIDGE_SCRIPT: &str = include_str!("../../assets/sandbox_bridge.js");

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("Request '{reference}' timed out after {}s", .after.as_secs())]
    Timeout { reference: String, after: Duration },

    /// The broker answered with an error.
    #[error("{0}")]
    Rejected(String),

    #[error("Sandbox channel closed")]
    Closed,
}

/// The context's one outward channel. Every message leaving through it is
/// stamped with the owning context's id; guests cannot choose the source.
#[derive(Debug, Clone)]
pub struct Outlet {
    source: ContextId,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outlet {
    pub fn new(source: ContextId, tx: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { source, tx }
    }

    pub fn source(&self) -> ContextId {
        self.source
    }

    pub fn post(&self, message: &SandboxMessage) -> bool {
        self.tx.send(Envelope::new(self.source, message)).is_ok()
    }

    /// Forward an already-encoded message from an out-of-process guest.
    pub fn post_raw(&self, payload: Value) -> bool {
        self.tx
            .send(Envelope {
                source: self.source,
                payload,
            })
            .is_ok()
    }
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ApiResponse>>>>;

/// Removes a pending record when the waiting call finishes, times out or is
/// dropped.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ApiResponse>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Bridge {
    outlet: Outlet,
    pending: PendingMap,
    timeout: Duration,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("context", &self.outlet.source)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Bridge {
    pub fn new(outlet: Outlet) -> Self {
        Self {
            outlet,
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn context_id(&self) -> ContextId {
        self.outlet.source
    }

    pub async fn query(&self, reference: &str, params: Option<Value>) -> Result<Value, BridgeError> {
        self.call(CallKind::Query, reference, params, None).await
    }

    pub async fn action(&self, reference: &str, data: Option<Value>) -> Result<Value, BridgeError> {
        self.call(CallKind::Action, reference, None, data).await
    }

    /// Resolve the pending call tagged with `response.id`. Returns false when
    /// no such call is waiting (unknown, already answered or timed out).
    pub fn deliver(&self, response: ApiResponse) -> bool {
        let Some(sender) = lock(&self.pending).remove(&response.id) else {
            log::debug!("Dropping response for unknown request {}", response.id);
            return false;
        };
        sender.send(response).is_ok()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Drop every pending record; their callers observe [`BridgeError::Closed`].
    pub fn abandon_all(&self) {
        let abandoned = std::mem::take(&mut *lock(&self.pending));
        if !abandoned.is_empty() {
            log::debug!(
                "Abandoning {} pending request(s) for context {}",
                abandoned.len(),
                self.outlet.source
            );
        }
    }

    async fn call(
        &self,
        method: CallKind,
        reference: &str,
        params: Option<Value>,
        data: Option<Value>,
    ) -> Result<Value, BridgeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let (resp_tx, resp_rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), resp_tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id: id.clone(),
        };

        let request = SandboxMessage::ApiRequest(ApiRequest {
            id,
            method,
            reference: reference.to_string(),
            params,
            data,
        });
        if !self.outlet.post(&request) {
            return Err(BridgeError::Closed);
        }

        match tokio::time::timeout(self.timeout, resp_rx).await {
            Ok(Ok(response)) => response.into_result().map_err(BridgeError::Rejected),
            Ok(Err(_)) => Err(BridgeError::Closed),
            Err(_) => Err(BridgeError::Timeout {
                reference: reference.to_string(),
                after: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bridge() -> (Arc<Bridge>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Bridge::new(Outlet::new(ContextId::new(), tx))), rx)
    }

    fn request_id(envelope: &Envelope) -> String {
        envelope.payload["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn response_resolves_matching_call() {
        let (bridge, mut outbox) = bridge();
        let caller = Arc::clone(&bridge);
        let call = tokio::spawn(async move { caller.query("listTasks", None).await });

        let envelope = outbox.recv().await.unwrap();
        assert_eq!(envelope.source, bridge.context_id());
        assert_eq!(envelope.payload["kind"], "api-request");
        assert_eq!(envelope.payload["method"], "query");
        assert!(bridge.deliver(ApiResponse::success(request_id(&envelope), json!([1]))));

        assert_eq!(call.await.unwrap(), Ok(json!([1])));
        assert_eq!(bridge.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_response_rejects() {
        let (bridge, mut outbox) = bridge();
        let caller = Arc::clone(&bridge);
        let call = tokio::spawn(async move { caller.action("createTask", Some(json!({}))).await });

        let envelope = outbox.recv().await.unwrap();
        bridge.deliver(ApiResponse::failure(request_id(&envelope), "Request failed (500)"));
        assert_eq!(
            call.await.unwrap(),
            Err(BridgeError::Rejected("Request failed (500)".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_and_late_response_is_ignored() {
        let (bridge, mut outbox) = bridge();
        let caller = Arc::clone(&bridge);
        let started = tokio::time::Instant::now();
        let call = tokio::spawn(async move { caller.query("listTasks", None).await });

        let envelope = outbox.recv().await.unwrap();
        assert_eq!(bridge.pending_count(), 1);

        let result = call.await.unwrap();
        let waited = started.elapsed();
        assert!(waited >= REQUEST_TIMEOUT && waited < REQUEST_TIMEOUT + Duration::from_secs(1));
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
        assert_eq!(bridge.pending_count(), 0);

        assert!(!bridge.deliver(ApiResponse::success(request_id(&envelope), json!(1))));
    }

    #[tokio::test]
    async fn abandoning_closes_waiting_calls() {
        let (bridge, mut outbox) = bridge();
        let caller = Arc::clone(&bridge);
        let call = tokio::spawn(async move { caller.query("listTasks", None).await });

        outbox.recv().await.unwrap();
        bridge.abandon_all();
        assert_eq!(call.await.unwrap(), Err(BridgeError::Closed));
    }

    #[tokio::test]
    async fn closed_outlet_fails_fast() {
        let (bridge, outbox) = bridge();
        drop(outbox);
        assert_eq!(bridge.query("listTasks", None).await, Err(BridgeError::Closed));
        assert_eq!(bridge.pending_count(), 0);
    }
}
