use serde::{Deserialize, Serialize};
use std::fmt;

use crate::arbiter::TokenUsage;
use crate::references::ApiBinding;

/// Structured interpretation of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    #[serde(default)]
    pub ui_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub entity_focus: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl Intent {
    /// Intent used when the intent step's output cannot be parsed.
    pub fn free_form(text: &str) -> Self {
        Self {
            ui_type: "custom".to_string(),
            description: text.trim().to_string(),
            ..Self::default()
        }
    }
}

/// The request needs more input before anything can be generated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

/// Parse result of the intent step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentOutcome {
    Intent(Intent),
    Clarification(Clarification),
    /// No JSON object could be read; carries the raw text.
    Unparsable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl Issue {
    /// `[category] description → suggestion`
    pub fn feedback_line(&self) -> String {
        match self.suggestion.as_deref().filter(|s| !s.is_empty()) {
            Some(suggestion) => format!(
                "[{}] {} → {}",
                self.category, self.description, suggestion
            ),
            None => format!("[{}] {}", self.category, self.description),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: Verdict,
    #[serde(default)]
    pub issues: Option<Vec<Issue>>,
    #[serde(default)]
    pub notes: String,
}

impl ReviewVerdict {
    pub fn pass(notes: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Pass,
            issues: None,
            notes: notes.into(),
        }
    }

    /// Error-severity issues of a failed review; empty for a pass.
    pub fn blocking_issues(&self) -> Vec<&Issue> {
        if self.verdict == Verdict::Pass {
            return Vec::new();
        }
        self.issues
            .iter()
            .flatten()
            .filter(|issue| issue.severity == Severity::Error)
            .collect()
    }
}

/// Parse result of the review step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewOutcome {
    Verdict(ReviewVerdict),
    Unparsable(String),
}

impl ReviewOutcome {
    pub fn into_verdict(self) -> ReviewVerdict {
        match self {
            ReviewOutcome::Verdict(verdict) => verdict,
            ReviewOutcome::Unparsable(_) => ReviewVerdict::pass(
                "Review response could not be parsed; accepting generated code",
            ),
        }
    }
}

/// Token totals accumulated over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub prompt: u64,
    pub completion: u64,
}

impl TokenTotals {
    pub fn add(&mut self, usage: &TokenUsage) {
        self.prompt += usage.prompt.unwrap_or(0);
        self.completion += usage.completion.unwrap_or(0);
    }

    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }
}

/// A fragment ready to be handed to a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedFragment {
    pub markup: String,
    pub styles: String,
    pub script: String,
    pub reasoning: String,
    pub api_bindings: Vec<ApiBinding>,
    pub iterations: u32,
    pub tokens_used: TokenTotals,
}

/// Terminal value of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineResult {
    Success(GeneratedFragment),
    #[serde(rename_all = "camelCase")]
    Clarification {
        question: String,
        options: Vec<String>,
        reasoning: String,
        tokens_used: TokenTotals,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        iterations: u32,
        tokens_used: TokenTotals,
    },
}

impl PipelineResult {
    pub fn tokens_used(&self) -> TokenTotals {
        match self {
            PipelineResult::Success(fragment) => fragment.tokens_used,
            PipelineResult::Clarification { tokens_used, .. }
            | PipelineResult::Error { tokens_used, .. } => *tokens_used,
        }
    }

    pub fn as_fragment(&self) -> Option<&GeneratedFragment> {
        match self {
            PipelineResult::Success(fragment) => Some(fragment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStep {
    Intent,
    Codegen,
    Review,
    Iterate,
    Resolve,
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineStep::Intent => "intent",
            PipelineStep::Codegen => "codegen",
            PipelineStep::Review => "review",
            PipelineStep::Iterate => "iterate",
            PipelineStep::Resolve => "resolve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Done,
    Failed,
}
