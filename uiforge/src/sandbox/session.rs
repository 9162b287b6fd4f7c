//! Sandbox sessions
//!
//! At most one live session per rendering surface. Starting a session on an
//! occupied surface tears the old one down (listener unregistered, isolate
//! terminated, pending calls abandoned) before the new isolate is launched.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::broker::ApiBroker;
use super::host_client::HostClient;
use super::isolate::{IsolateLauncher, IsolatedContext, SandboxProgram};
use super::messages::{ContextId, SandboxErrorReport};
use crate::error::ForgeResult;
use crate::pipeline::GeneratedFragment;
use crate::references::ApiBinding;

/// Name of a rendering surface in the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceId(String);

impl SurfaceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SurfaceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for SurfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller's view of a started session.
#[derive(Debug)]
pub struct SandboxSession {
    surface: SurfaceId,
    context_id: ContextId,
    markup: String,
    styles: String,
    bindings: Vec<ApiBinding>,
    errors: mpsc::UnboundedReceiver<SandboxErrorReport>,
}

impl SandboxSession {
    pub fn surface(&self) -> &SurfaceId {
        &self.surface
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn markup(&self) -> &str {
        &self.markup
    }

    pub fn styles(&self) -> &str {
        &self.styles
    }

    pub fn bindings(&self) -> &[ApiBinding] {
        &self.bindings
    }

    /// Next uncaught-error report from the isolate; `None` once the session
    /// is torn down.
    pub async fn next_error(&mut self) -> Option<SandboxErrorReport> {
        self.errors.recv().await
    }
}

struct LiveSession {
    context: Arc<dyn IsolatedContext>,
    listener: JoinHandle<()>,
}

impl LiveSession {
    async fn teardown(self) {
        self.listener.abort();
        let _ = self.listener.await;
        self.context.terminate();
        log::info!("Sandbox session {} torn down", self.context.id());
    }
}

pub struct SessionManager {
    launcher: Arc<dyn IsolateLauncher>,
    host: Arc<dyn HostClient>,
    sessions: Mutex<HashMap<SurfaceId, LiveSession>>,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn IsolateLauncher>, host: Arc<dyn HostClient>) -> Self {
        Self {
            launcher,
            host,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Replace whatever runs on `surface` with `fragment`.
    pub async fn start(
        &self,
        surface: SurfaceId,
        fragment: &GeneratedFragment,
    ) -> ForgeResult<SandboxSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&surface) {
            previous.teardown().await;
        }

        let (outbox, inbox) = mpsc::unbounded_channel();
        let context = self
            .launcher
            .launch(SandboxProgram::from(fragment), outbox)
            .await?;
        let context_id = context.id();

        let broker = Arc::new(ApiBroker::new(
            context_id,
            &fragment.api_bindings,
            Arc::clone(&self.host),
        ));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(broker.listen(inbox, Arc::clone(&context), errors_tx));

        sessions.insert(surface.clone(), LiveSession { context, listener });
        log::info!(
            "Sandbox session {} active on surface '{}' with {} binding(s)",
            context_id,
            surface,
            fragment.api_bindings.len()
        );

        Ok(SandboxSession {
            surface,
            context_id,
            markup: fragment.markup.clone(),
            styles: fragment.styles.clone(),
            bindings: fragment.api_bindings.clone(),
            errors: errors_rx,
        })
    }

    /// Context currently live on `surface`.
    pub async fn active(&self, surface: &SurfaceId) -> Option<ContextId> {
        self.sessions
            .lock()
            .await
            .get(surface)
            .map(|session| session.context.id())
    }

    pub async fn stop(&self, surface: &SurfaceId) -> bool {
        let removed = self.sessions.lock().await.remove(surface);
        match removed {
            Some(session) => {
                session.teardown().await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<LiveSession> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        for session in drained {
            session.teardown().await;
        }
    }
}
