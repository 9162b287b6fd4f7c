//! Sandbox execution and the capability-scoped broker.
//!
//! Generated code runs inside an isolate whose only outward path is one
//! message channel. On the trusted side an [`ApiBroker`] checks each request
//! against the bindings frozen by the pipeline and performs the real host
//! call through a [`HostClient`].

pub mod bridge;
pub mod broker;
pub mod host_client;
pub mod isolate;
pub mod messages;
pub mod process;
pub mod session;

pub use bridge::{Bridge, BridgeError, Outlet, BRIDGE_SCRIPT, REQUEST_TIMEOUT};
pub use broker::{build_host_request, ApiBroker, BrokerError, InboundRequest};
pub use host_client::{HostClient, HostRequest, HostResponse, HttpHostClient};
pub use isolate::{
    Guest, GuestContext, GuestResult, IsolateLauncher, IsolatedContext, LocalLauncher,
    SandboxProgram,
};
pub use messages::{
    ApiRequest, ApiResponse, ContextId, Envelope, SandboxErrorReport, SandboxMessage,
};
pub use process::{no_sandbox_requested, render_program, ProcessLauncher, UIFORGE_NO_SANDBOX};
pub use session::{SandboxSession, SessionManager, SurfaceId};
