//! uiforge
//!
//! Turns a natural-language request into an API-bound UI fragment and runs it
//! behind a capability-scoped broker:
//!
//! - [`pipeline`] drives a bounded intent → codegen → review → iterate loop
//!   against a text-generation provider ([`arbiter`]).
//! - [`references`] statically extracts the host calls a generated script
//!   makes and freezes them into a whitelist of [`references::ApiBinding`]s.
//! - [`sandbox`] executes the script in an isolate whose only way out is a
//!   message channel to an [`sandbox::ApiBroker`] enforcing that whitelist.

pub mod arbiter;
pub mod capability_map;
pub mod codeblocks;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod references;
pub mod sandbox;

pub use capability_map::CapabilityMap;
pub use codeblocks::{parse_code_blocks, GeneratedCode};
pub use config::ForgeConfig;
pub use error::{ForgeError, ForgeResult};
pub use pipeline::{GeneratedFragment, Pipeline, PipelineResult};
pub use references::{extract_references, validate_references, ApiBinding};
