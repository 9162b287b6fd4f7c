//! Isolated execution contexts.
//!
//! An isolate runs one generated fragment with no ambient capability: the
//! only way out is the [`Outlet`] handed over at launch, the only way in is
//! [`IsolatedContext::post`]. Uncaught guest failures are reported through
//! the outlet as `sandbox-error` messages.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::bridge::{Bridge, Outlet};
use super::messages::{ContextId, Envelope, SandboxErrorReport, SandboxMessage};
use crate::error::ForgeResult;
use crate::pipeline::GeneratedFragment;

/// What gets loaded into an isolate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxProgram {
    pub markup: String,
    pub styles: String,
    pub script: String,
}

impl From<&GeneratedFragment> for SandboxProgram {
    fn from(fragment: &GeneratedFragment) -> Self {
        Self {
            markup: fragment.markup.clone(),
            styles: fragment.styles.clone(),
            script: fragment.script.clone(),
        }
    }
}

pub trait IsolatedContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Deliver a message into the context. Returns false once the context
    /// can no longer receive.
    fn post(&self, message: SandboxMessage) -> bool;

    /// Stop the guest and abandon its pending calls. Idempotent.
    fn terminate(&self);
}

#[async_trait]
pub trait IsolateLauncher: Send + Sync {
    async fn launch(
        &self,
        program: SandboxProgram,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> ForgeResult<Arc<dyn IsolatedContext>>;
}

/// Everything an in-process guest can touch.
#[derive(Clone)]
pub struct GuestContext {
    pub bridge: Arc<Bridge>,
    pub markup: String,
    pub styles: String,
    pub script: String,
}

pub type GuestResult = Result<(), String>;
pub type Guest = Arc<dyn Fn(GuestContext) -> BoxFuture<'static, GuestResult> + Send + Sync>;

/// Runs a native guest as a tokio task. The guest holds no handle to the
/// embedding process beyond its [`GuestContext`].
#[derive(Clone)]
pub struct LocalLauncher {
    guest: Guest,
}

impl LocalLauncher {
    pub fn new<F, Fut>(guest: F) -> Self
    where
        F: Fn(GuestContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = GuestResult> + Send + 'static,
    {
        Self {
            guest: Arc::new(move |ctx| guest(ctx).boxed()),
        }
    }
}

#[async_trait]
impl IsolateLauncher for LocalLauncher {
    async fn launch(
        &self,
        program: SandboxProgram,
        outbox: mpsc::UnboundedSender<Envelope>,
    ) -> ForgeResult<Arc<dyn IsolatedContext>> {
        let id = ContextId::new();
        let outlet = Outlet::new(id, outbox);
        let bridge = Arc::new(Bridge::new(outlet.clone()));
        let guest_context = GuestContext {
            bridge: Arc::clone(&bridge),
            markup: program.markup,
            styles: program.styles,
            script: program.script,
        };

        let guest = Arc::clone(&self.guest);
        let task = tokio::spawn(async move {
            let report = match AssertUnwindSafe(guest(guest_context)).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(message)) => Some(message),
                Err(panic) => Some(panic_message(panic)),
            };
            if let Some(message) = report {
                log::warn!("Guest in context {} failed: {}", id, message);
                outlet.post(&SandboxMessage::SandboxError(SandboxErrorReport::new(message)));
            }
        });
        log::debug!("Launched local isolate {}", id);

        Ok(Arc::new(LocalContext {
            id,
            bridge,
            task: Mutex::new(Some(task)),
        }))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "guest panicked".to_string()
    }
}

struct LocalContext {
    id: ContextId,
    bridge: Arc<Bridge>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IsolatedContext for LocalContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn post(&self, message: SandboxMessage) -> bool {
        match message {
            SandboxMessage::ApiResponse(response) => self.bridge.deliver(response),
            other => {
                log::debug!("Context {} ignores inbound {:?}", self.id, other);
                false
            }
        }
    }

    fn terminate(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            self.bridge.abandon_all();
            log::debug!("Terminated local isolate {}", self.id);
        }
    }
}

impl Drop for LocalContext {
    fn drop(&mut self) {
        self.terminate();
    }
}
