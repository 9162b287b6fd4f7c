//! Generation pipeline
//!
//! Turns a natural-language request into a [`GeneratedFragment`] (or a
//! clarification question) by chaining intent analysis, code generation,
//! review and bounded regeneration, then binding the script's host calls
//! against the capability map.

pub mod orchestrator;
pub mod parsing;
pub mod progress;
pub mod types;

pub use orchestrator::{format_feedback, Pipeline, MAX_ITERATIONS};
pub use parsing::{find_first_json_object, parse_intent, parse_review};
pub use progress::{ProgressCallback, ProgressReporter};
pub use types::{
    Clarification, GeneratedFragment, Intent, IntentOutcome, Issue, PipelineResult, PipelineStep,
    ReviewOutcome, ReviewVerdict, Severity, StepStatus, TokenTotals, Verdict,
};
