//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by uiforge's fallible operations.
///
/// Failures that are recovered locally (malformed review output, unknown
/// references caught after review, broker rejections) are modelled as data
/// in their own modules and never reach this type.
#[derive(Debug, Error)]
pub enum ForgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Capability map error: {0}")]
    CapabilityMap(String),

    #[error("LLM provider error: {0}")]
    Llm(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Sandbox error: {0}")]
    Sandbox(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type ForgeResult<T> = Result<T, ForgeError>;
