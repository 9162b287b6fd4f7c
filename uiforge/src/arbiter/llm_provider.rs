//! LLM Provider Abstraction
//!
//! One text-generation call: `(prompt, system prompt, provider config)` in,
//! `{ text, tokens_used }` out. Retries and backoff are left to the caller's
//! transport; every provider here makes exactly one request per call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{ForgeError, ForgeResult};

/// Supported provider types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    Stub,      // Deterministic, scripted responses
    OpenAI,    // OpenAI-compatible chat completions (OpenAI, OpenRouter, local gateways)
    Anthropic, // Anthropic messages API
}

impl std::str::FromStr for LlmProviderType {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stub" => Ok(LlmProviderType::Stub),
            "openai" | "openrouter" => Ok(LlmProviderType::OpenAI),
            "anthropic" => Ok(LlmProviderType::Anthropic),
            other => Err(ForgeError::Config(format!(
                "Invalid LLM provider '{}'. Use: openai, openrouter, anthropic, or stub",
                other
            ))),
        }
    }
}

/// Configuration for LLM providers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProviderConfig {
    pub provider_type: LlmProviderType,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl Default for LlmProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: LlmProviderType::Stub,
            model: "stub-model".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            timeout_seconds: Some(120),
        }
    }
}

/// Token usage reported by one call. Providers that omit a field leave it
/// `None`; accounting treats it as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt: Option<u64>,
    #[serde(default)]
    pub completion: Option<u64>,
}

/// Result of one text-generation call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: TokenUsage,
}

/// Information about an LLM provider
#[derive(Debug, Clone)]
pub struct LlmProviderInfo {
    pub name: String,
    pub model: String,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn call(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &LlmProviderConfig,
    ) -> ForgeResult<Completion>;

    fn info(&self) -> LlmProviderInfo;
}

/// Build the provider selected by `config.provider_type`.
pub fn create_provider(config: &LlmProviderConfig) -> ForgeResult<Box<dyn LlmProvider>> {
    match config.provider_type {
        LlmProviderType::Stub => Ok(Box::new(StubProvider::new(Vec::<String>::new()))),
        LlmProviderType::OpenAI => Ok(Box::new(OpenAiProvider::new(config)?)),
        LlmProviderType::Anthropic => Ok(Box::new(AnthropicProvider::new(config)?)),
    }
}

fn build_client(config: &LlmProviderConfig) -> ForgeResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.timeout_seconds.unwrap_or(120),
        ))
        .build()
        .map_err(|e| ForgeError::Llm(format!("Failed to create HTTP client: {}", e)))
}

fn preview(body: &str) -> String {
    if body.len() > 500 {
        let mut end = 500;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, total length: {} bytes]", &body[..end], body.len())
    } else {
        body.to_string()
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider
// ---------------------------------------------------------------------------

/// OpenAI-compatible provider (works with OpenAI and OpenRouter)
pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
}

impl OpenAiProvider {
    pub fn new(config: &LlmProviderConfig) -> ForgeResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    async fn call(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &LlmProviderConfig,
    ) -> ForgeResult<Completion> {
        let api_key = config
            .api_key
            .as_ref()
            .ok_or_else(|| ForgeError::Llm("API key required for OpenAI provider".to_string()))?;
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        let mut messages = Vec::with_capacity(2);
        if !system_prompt.is_empty() {
            messages.push(OpenAiMessage {
                role: "system".to_string(),
                content: Some(system_prompt.to_string()),
            });
        }
        messages.push(OpenAiMessage {
            role: "user".to_string(),
            content: Some(prompt.to_string()),
        });
        let request_body = OpenAiRequest {
            model: &config.model,
            messages,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ForgeError::Llm(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| ForgeError::Llm(format!("Failed to read LLM API response body: {}", e)))?;

        if !status.is_success() {
            return Err(ForgeError::Llm(format!(
                "LLM API returned {}: {}",
                status.as_u16(),
                preview(&raw_body)
            )));
        }

        let body: OpenAiResponse = serde_json::from_str(&raw_body).map_err(|e| {
            ForgeError::Llm(format!(
                "Failed to parse LLM API response: {}. Response was: {}",
                e,
                preview(&raw_body)
            ))
        })?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ForgeError::Llm("LLM response missing choices".to_string()))?;

        if choice.finish_reason.as_deref() == Some("length") {
            log::warn!(
                "LLM response was truncated (finish_reason: length, max_tokens: {:?})",
                config.max_tokens
            );
        }

        let usage = body.usage.unwrap_or_default();
        log::debug!(
            "OpenAI call to {} finished in {}ms",
            self.model,
            start.elapsed().as_millis()
        );

        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            tokens_used: TokenUsage {
                prompt: usage.prompt_tokens,
                completion: usage.completion_tokens,
            },
        })
    }

    fn info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "openai".to_string(),
            model: self.model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Anthropic provider
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    client: reqwest::Client,
    model: String,
}

impl AnthropicProvider {
    pub fn new(config: &LlmProviderConfig) -> ForgeResult<Self> {
        Ok(Self {
            client: build_client(config)?,
            model: config.model.clone(),
        })
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    async fn call(
        &self,
        prompt: &str,
        system_prompt: &str,
        config: &LlmProviderConfig,
    ) -> ForgeResult<Completion> {
        let api_key = config.api_key.as_ref().ok_or_else(|| {
            ForgeError::Llm("API key required for Anthropic provider".to_string())
        })?;
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1");
        let url = format!("{}/messages", base_url.trim_end_matches('/'));

        let request_body = AnthropicRequest {
            model: &config.model,
            max_tokens: config.max_tokens.unwrap_or(4096),
            system: system_prompt,
            messages: vec![AnthropicMessage {
                role: "user",
                content: prompt,
            }],
            temperature: config.temperature,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| ForgeError::Llm(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| ForgeError::Llm(format!("Failed to read LLM API response body: {}", e)))?;

        if !status.is_success() {
            return Err(ForgeError::Llm(format!(
                "LLM API returned {}: {}",
                status.as_u16(),
                preview(&raw_body)
            )));
        }

        let body: AnthropicResponse = serde_json::from_str(&raw_body).map_err(|e| {
            ForgeError::Llm(format!(
                "Failed to parse LLM API response: {}. Response was: {}",
                e,
                preview(&raw_body)
            ))
        })?;

        let text = body
            .content
            .into_iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        let usage = body.usage.unwrap_or_default();

        Ok(Completion {
            text,
            tokens_used: TokenUsage {
                prompt: usage.input_tokens,
                completion: usage.output_tokens,
            },
        })
    }

    fn info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "anthropic".to_string(),
            model: self.model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stub provider
// ---------------------------------------------------------------------------

/// A recorded call made against the [`StubProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub prompt: String,
    pub system_prompt: String,
}

/// Scripted provider: returns queued completions in order and records every
/// call. Once the script runs dry it answers with an empty completion.
pub struct StubProvider {
    responses: Mutex<VecDeque<Completion>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl StubProvider {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_completions(responses.into_iter().map(|text| Completion {
            text: text.into(),
            tokens_used: TokenUsage::default(),
        }))
    }

    pub fn with_completions<I>(completions: I) -> Self
    where
        I: IntoIterator<Item = Completion>,
    {
        Self {
            responses: Mutex::new(completions.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    async fn call(
        &self,
        prompt: &str,
        system_prompt: &str,
        _config: &LlmProviderConfig,
    ) -> ForgeResult<Completion> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                prompt: prompt.to_string(),
                system_prompt: system_prompt.to_string(),
            });
        }
        let next = self
            .responses
            .lock()
            .map_err(|e| ForgeError::Llm(format!("Stub provider mutex poisoned: {}", e)))?
            .pop_front();
        Ok(next.unwrap_or_default())
    }

    fn info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "stub".to_string(),
            model: "stub-model".to_string(),
        }
    }
}
