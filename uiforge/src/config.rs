use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::arbiter::{FilePromptStore, LlmProviderConfig, LlmProviderType, PromptManager};
use crate::error::{ForgeError, ForgeResult};

/// Top-level uiforge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    /// Text-generation provider used by the pipeline
    pub llm: LlmProviderConfig,
    /// Prompt template overrides
    pub prompts: PromptsConfig,
    /// Isolated execution of generated scripts
    pub sandbox: SandboxSettings,
    /// Host application the broker forwards calls to
    pub host: HostSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Directory holding `<template_id>.md` overrides
    pub dir: Option<PathBuf>,
}

impl PromptsConfig {
    pub fn manager(&self) -> PromptManager {
        match &self.dir {
            Some(dir) => PromptManager::new(Arc::new(FilePromptStore::new(dir))),
            None => PromptManager::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Script interpreter run inside the isolate
    pub interpreter: String,
    /// Extra arguments passed before the program path
    pub args: Vec<String>,
    /// Jail the interpreter with bubblewrap (no network, private namespaces)
    pub use_bubblewrap: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            interpreter: "node".to_string(),
            args: Vec::new(),
            use_bubblewrap: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Host origin plus optional path prefix; binding paths resolve beneath it
    pub base_url: Option<String>,
    /// Sent as `Authorization: Bearer <token>`
    pub auth_token: Option<String>,
    /// Sent verbatim as the `Cookie` header
    pub cookie: Option<String>,
}

impl ForgeConfig {
    /// Create a configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ForgeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ForgeError::Config(format!(
                "Failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Create a configuration from `UIFORGE_*` environment variables
    pub fn from_env() -> ForgeResult<Self> {
        let mut config = ForgeConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// File (when given) overlaid with the environment
    pub fn load(path: Option<&Path>) -> ForgeResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => ForgeConfig::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> ForgeResult<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars<F>(&mut self, var: F) -> ForgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(provider) = var("UIFORGE_LLM_PROVIDER") {
            self.llm.provider_type = provider.parse()?;
            if provider.eq_ignore_ascii_case("openrouter") && self.llm.base_url.is_none() {
                self.llm.base_url = Some("https://openrouter.ai/api/v1".to_string());
            }
            if self.llm.provider_type == LlmProviderType::Stub {
                log::warn!("Using stub LLM provider (testing only)");
            }
        }
        if let Some(model) = var("UIFORGE_LLM_MODEL") {
            self.llm.model = model;
        }
        if let Some(key) = var("UIFORGE_LLM_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(url) = var("UIFORGE_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        if let Some(tokens) = var("UIFORGE_LLM_MAX_TOKENS").and_then(|s| s.parse().ok()) {
            self.llm.max_tokens = Some(tokens);
        }
        if let Some(temp) = var("UIFORGE_LLM_TEMPERATURE").and_then(|s| s.parse().ok()) {
            self.llm.temperature = Some(temp);
        }
        if let Some(timeout) = var("UIFORGE_LLM_TIMEOUT").and_then(|s| s.parse().ok()) {
            self.llm.timeout_seconds = Some(timeout);
        }

        if let Some(dir) = var("UIFORGE_PROMPTS_DIR") {
            self.prompts.dir = Some(PathBuf::from(dir));
        }

        if var("UIFORGE_NO_SANDBOX")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v == "yes")
            .unwrap_or(false)
        {
            self.sandbox.use_bubblewrap = false;
        }

        if let Some(url) = var("UIFORGE_HOST_URL") {
            self.host.base_url = Some(url);
        }
        if let Some(token) = var("UIFORGE_HOST_TOKEN") {
            self.host.auth_token = Some(token);
        }
        if let Some(cookie) = var("UIFORGE_HOST_COOKIE") {
            self.host.cookie = Some(cookie);
        }
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.llm.model.trim().is_empty() {
            errors.push("LLM model must not be empty".to_string());
        }
        match self.llm.provider_type {
            LlmProviderType::Anthropic if self.llm.api_key.is_none() => {
                errors.push("Anthropic provider requires an api_key".to_string());
            }
            LlmProviderType::OpenAI if self.llm.api_key.is_none() && self.llm.base_url.is_none() => {
                errors.push("OpenAI provider requires an api_key or a base_url".to_string());
            }
            _ => {}
        }
        if let Some(temp) = self.llm.temperature {
            if !(0.0..=1.0).contains(&temp) {
                errors.push("LLM temperature must be between 0.0 and 1.0".to_string());
            }
        }
        if self.llm.max_tokens == Some(0) {
            errors.push("LLM max_tokens must be greater than 0".to_string());
        }

        if let Some(dir) = &self.prompts.dir {
            if !dir.is_dir() {
                errors.push(format!("Prompts directory {} does not exist", dir.display()));
            }
        }

        if self.sandbox.interpreter.trim().is_empty() {
            errors.push("Sandbox interpreter must not be empty".to_string());
        }

        if let Some(base_url) = &self.host.base_url {
            if let Err(e) = url::Url::parse(base_url) {
                errors.push(format!("Invalid host base_url '{}': {}", base_url, e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ForgeConfig::default();
        assert_eq!(config.llm.provider_type, LlmProviderType::Stub);
        assert_eq!(config.sandbox.interpreter, "node");
        assert!(config.sandbox.use_bubblewrap);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_toml_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[llm]
provider_type = "anthropic"
model = "claude-test"
api_key = "k"

[sandbox]
interpreter = "deno"
args = ["run"]
use_bubblewrap = false

[host]
base_url = "http://localhost:3000"
"#
        )
        .unwrap();

        let config = ForgeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.llm.provider_type, LlmProviderType::Anthropic);
        assert_eq!(config.sandbox.args, vec!["run"]);
        assert!(!config.sandbox.use_bubblewrap);
        assert_eq!(config.host.base_url.as_deref(), Some("http://localhost:3000"));
        assert!(config.prompts.dir.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides() {
        let mut config = ForgeConfig::default();
        config
            .apply_vars(vars(&[
                ("UIFORGE_LLM_PROVIDER", "openrouter"),
                ("UIFORGE_LLM_MODEL", "some/model"),
                ("UIFORGE_LLM_MAX_TOKENS", "not-a-number"),
                ("UIFORGE_NO_SANDBOX", "1"),
                ("UIFORGE_HOST_TOKEN", "secret"),
            ]))
            .unwrap();

        assert_eq!(config.llm.provider_type, LlmProviderType::OpenAI);
        assert_eq!(
            config.llm.base_url.as_deref(),
            Some("https://openrouter.ai/api/v1")
        );
        assert_eq!(config.llm.model, "some/model");
        assert_eq!(config.llm.max_tokens, Some(4096));
        assert!(!config.sandbox.use_bubblewrap);
        assert_eq!(config.host.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn rejects_unknown_provider() {
        let mut config = ForgeConfig::default();
        let err = config
            .apply_vars(vars(&[("UIFORGE_LLM_PROVIDER", "gpt-local")]))
            .unwrap_err();
        assert!(err.to_string().contains("Invalid LLM provider"));
    }

    #[test]
    fn validate_collects_every_problem() {
        let mut config = ForgeConfig::default();
        config.llm.provider_type = LlmProviderType::Anthropic;
        config.llm.temperature = Some(1.5);
        config.sandbox.interpreter = String::new();
        config.host.base_url = Some("not a url".to_string());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{:?}", errors);
    }
}
