use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use uiforge::pipeline::{GeneratedFragment, TokenTotals};
use uiforge::references::{validate_references, ApiBinding, CallKind, ResolvedEndpoint};
use uiforge::sandbox::{
    ApiBroker, ContextId, Envelope, GuestContext, GuestResult, HostClient, HostRequest,
    HostResponse, LocalLauncher, SessionManager, SurfaceId,
};
use uiforge::CapabilityMap;

/// Host double: records every request and replays scripted replies.
#[derive(Default)]
struct RecordingHost {
    requests: Mutex<Vec<HostRequest>>,
    replies: Mutex<VecDeque<Result<HostResponse, String>>>,
}

impl RecordingHost {
    fn replying(replies: Vec<Result<HostResponse, String>>) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            replies: Mutex::new(replies.into()),
        })
    }

    fn requests(&self) -> Vec<HostRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostClient for RecordingHost {
    async fn send(&self, request: HostRequest) -> Result<HostResponse, String> {
        self.requests.lock().unwrap().push(request);
        self.replies.lock().unwrap().pop_front().unwrap_or(Ok(HostResponse {
            status: 200,
            body: Value::Null,
        }))
    }
}

fn ok(body: Value) -> Result<HostResponse, String> {
    Ok(HostResponse { status: 200, body })
}

fn bindings() -> Vec<ApiBinding> {
    vec![
        ApiBinding {
            kind: CallKind::Query,
            reference: "listTasks".to_string(),
            resolved: ResolvedEndpoint {
                method: "GET".to_string(),
                path: "/api/tasks".to_string(),
            },
        },
        ApiBinding {
            kind: CallKind::Action,
            reference: "createTask".to_string(),
            resolved: ResolvedEndpoint {
                method: "POST".to_string(),
                path: "/api/tasks".to_string(),
            },
        },
    ]
}

fn request(source: ContextId, payload: Value) -> Envelope {
    Envelope { source, payload }
}

#[tokio::test]
async fn test_query_params_are_encoded_into_the_path() {
    let host = RecordingHost::replying(vec![ok(json!([{"id": 1}]))]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let response = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "r1", "method": "query", "ref": "listTasks", "params": {"status": "todo"}}),
        ))
        .await
        .expect("answered");

    assert_eq!(response.id, "r1");
    assert_eq!(response.data, Some(json!([{"id": 1}])));
    assert_eq!(response.error, None);
    assert_eq!(
        host.requests(),
        vec![HostRequest {
            method: "GET".to_string(),
            path: "/api/tasks?status=todo".to_string(),
            body: None,
        }]
    );
}

#[tokio::test]
async fn test_action_sends_json_body() {
    let host = RecordingHost::replying(vec![ok(json!({"id": 7}))]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let response = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "a1", "method": "action", "ref": "createTask", "data": {"title": "x"}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.data, Some(json!({"id": 7})));
    let sent = host.requests();
    assert_eq!(sent[0].method, "POST");
    assert_eq!(sent[0].path, "/api/tasks");
    assert_eq!(sent[0].body, Some(json!({"title": "x"})));
}

#[tokio::test]
async fn test_unknown_reference_never_reaches_the_host() {
    let host = RecordingHost::replying(vec![]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let response = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "r2", "method": "action", "ref": "deleteEverything"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.data, None);
    assert_eq!(
        response.error.as_deref(),
        Some("Unknown API reference: deleteEverything")
    );
    assert!(host.requests().is_empty());
}

#[tokio::test]
async fn test_type_mismatch_is_rejected_without_host_call() {
    let host = RecordingHost::replying(vec![]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let response = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "r3", "method": "action", "ref": "listTasks"}),
        ))
        .await
        .unwrap();

    assert_eq!(
        response.error.as_deref(),
        Some("API reference 'listTasks' is a query, not a action")
    );
    assert!(host.requests().is_empty());
}

#[tokio::test]
async fn test_host_failures_become_call_errors() {
    let host = RecordingHost::replying(vec![
        Ok(HostResponse {
            status: 422,
            body: json!({"error": "title is required"}),
        }),
        Ok(HostResponse {
            status: 500,
            body: Value::Null,
        }),
        Err("connection refused".to_string()),
    ]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let mut errors = Vec::new();
    for id in ["e1", "e2", "e3"] {
        let response = broker
            .handle_envelope(&request(
                context,
                json!({"kind": "api-request", "id": id, "method": "action", "ref": "createTask", "data": {}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.id, id);
        assert_eq!(response.data, None);
        errors.push(response.error.unwrap());
    }
    assert_eq!(
        errors,
        vec!["title is required", "Request failed (500)", "connection refused"]
    );
    // one host call per request, no retries
    assert_eq!(host.requests().len(), 3);
}

#[tokio::test]
async fn test_dot_path_params_cannot_leave_the_bound_path() {
    let host = RecordingHost::replying(vec![]);
    let context = ContextId::new();
    let bindings = vec![
        ApiBinding {
            kind: CallKind::Action,
            reference: "deleteComment".to_string(),
            resolved: ResolvedEndpoint {
                method: "DELETE".to_string(),
                path: "/api/posts/:postId/comments/:id".to_string(),
            },
        },
        ApiBinding {
            kind: CallKind::Query,
            reference: "getTask".to_string(),
            resolved: ResolvedEndpoint {
                method: "GET".to_string(),
                path: "/api/tasks/:id".to_string(),
            },
        },
    ];
    let broker = ApiBroker::new(context, &bindings, host.clone());

    let escaped = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "p1", "method": "action", "ref": "deleteComment", "data": {"postId": "..", "id": "x"}}),
        ))
        .await
        .unwrap();
    assert_eq!(
        escaped.error.as_deref(),
        Some("Invalid value for path parameter 'postId' of API reference 'deleteComment'")
    );

    let parent = broker
        .handle_envelope(&request(
            context,
            json!({"kind": "api-request", "id": "p2", "method": "query", "ref": "getTask", "params": {"id": ".."}}),
        ))
        .await
        .unwrap();
    assert_eq!(parent.data, None);
    assert!(parent.error.is_some());
    assert!(host.requests().is_empty());
}

#[tokio::test]
async fn test_foreign_and_malformed_messages_are_ignored() {
    let host = RecordingHost::replying(vec![]);
    let context = ContextId::new();
    let broker = ApiBroker::new(context, &bindings(), host.clone());

    let foreign = request(
        ContextId::new(),
        json!({"kind": "api-request", "id": "f1", "method": "query", "ref": "listTasks"}),
    );
    assert!(broker.handle_envelope(&foreign).await.is_none());

    for payload in [
        json!({"kind": "api-request", "method": "query", "ref": "listTasks"}),
        json!({"kind": "api-request", "id": "m1", "method": "query"}),
        json!({"kind": "api-response", "id": "m2", "data": 1}),
        json!(null),
    ] {
        assert!(broker.handle_envelope(&request(context, payload)).await.is_none());
    }
    assert!(host.requests().is_empty());
}

const TASKS_MAP: &str = r#"{
    "queries": { "listTasks": { "endpoint": "GET /api/tasks" } },
    "actions": { "createTask": { "endpoint": "POST /api/tasks" } }
}"#;

fn fragment(script: &str) -> GeneratedFragment {
    let map = CapabilityMap::from_json_str(TASKS_MAP).unwrap();
    let report = validate_references(script, &map);
    GeneratedFragment {
        markup: "<ul id=\"tasks\"></ul>".to_string(),
        styles: String::new(),
        script: script.to_string(),
        reasoning: String::new(),
        api_bindings: report.bindings,
        iterations: 1,
        tokens_used: TokenTotals::default(),
    }
}

async fn counting_guest(ctx: GuestContext) -> GuestResult {
    let rows = ctx
        .bridge
        .query("listTasks", Some(json!({"status": "todo"})))
        .await
        .map_err(|e| e.to_string())?;
    let count = rows.as_array().map(Vec::len).unwrap_or(0);
    Err(format!("rendered {} rows into {}", count, ctx.markup))
}

async fn sneaky_guest(ctx: GuestContext) -> GuestResult {
    ctx.bridge
        .action("deleteEverything", None)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

async fn waiting_guest(ctx: GuestContext) -> GuestResult {
    ctx.bridge
        .query("listTasks", None)
        .await
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[tokio::test]
async fn test_session_routes_guest_calls_through_broker() {
    let host = RecordingHost::replying(vec![ok(json!([{"id": 1}, {"id": 2}]))]);
    let sessions = SessionManager::new(Arc::new(LocalLauncher::new(counting_guest)), host.clone());

    let mut session = sessions
        .start(SurfaceId::from("main"), &fragment("await query(\"listTasks\")"))
        .await
        .unwrap();
    assert_eq!(session.markup(), "<ul id=\"tasks\"></ul>");
    assert_eq!(session.bindings().len(), 1);

    let report = session.next_error().await.expect("guest reports back");
    assert_eq!(report.message, "rendered 2 rows into <ul id=\"tasks\"></ul>");
    assert_eq!(host.requests()[0].path, "/api/tasks?status=todo");
}

#[tokio::test]
async fn test_guest_sees_broker_rejection() {
    let host = RecordingHost::replying(vec![]);
    let sessions = SessionManager::new(Arc::new(LocalLauncher::new(sneaky_guest)), host.clone());

    let mut session = sessions
        .start(SurfaceId::from("main"), &fragment("await query(\"listTasks\")"))
        .await
        .unwrap();

    let report = session.next_error().await.unwrap();
    assert_eq!(report.message, "Unknown API reference: deleteEverything");
    assert!(host.requests().is_empty());
}

#[tokio::test]
async fn test_starting_a_session_replaces_the_previous_one() {
    let host = RecordingHost::replying(vec![]);
    let sessions = SessionManager::new(Arc::new(LocalLauncher::new(waiting_guest)), host.clone());
    let surface = SurfaceId::from("main");

    let mut first = sessions
        .start(surface.clone(), &fragment("query(\"listTasks\")"))
        .await
        .unwrap();
    let second = sessions
        .start(surface.clone(), &fragment("query(\"listTasks\")"))
        .await
        .unwrap();

    assert_ne!(first.context_id(), second.context_id());
    assert_eq!(sessions.active(&surface).await, Some(second.context_id()));
    // The first session's listener is gone, so its error stream ends.
    assert!(first.next_error().await.is_none());

    assert!(sessions.stop(&surface).await);
    assert!(!sessions.stop(&surface).await);
    assert_eq!(sessions.active(&surface).await, None);
}

#[tokio::test]
async fn test_surfaces_are_independent() {
    let host = RecordingHost::replying(vec![]);
    let sessions = SessionManager::new(Arc::new(LocalLauncher::new(waiting_guest)), host);

    let left = sessions
        .start(SurfaceId::from("left"), &fragment("query(\"listTasks\")"))
        .await
        .unwrap();
    let right = sessions
        .start(SurfaceId::from("right"), &fragment("query(\"listTasks\")"))
        .await
        .unwrap();

    assert_eq!(sessions.active(&SurfaceId::from("left")).await, Some(left.context_id()));
    assert_eq!(sessions.active(&SurfaceId::from("right")).await, Some(right.context_id()));

    sessions.stop_all().await;
    assert_eq!(sessions.active(&SurfaceId::from("left")).await, None);
    assert_eq!(sessions.active(&SurfaceId::from("right")).await, None);
}
