//! Pipeline Orchestrator
//!
//! Drives one run of Intent → Codegen → Review → (Iterate → Codegen)* →
//! Resolve against a text-generation provider. Calls are strictly
//! sequential; each prompt depends on the previous step's output.

use std::collections::HashMap;
use std::sync::Arc;

use super::parsing::{parse_intent, parse_review};
use super::progress::ProgressReporter;
use super::types::{
    GeneratedFragment, Intent, IntentOutcome, Issue, PipelineResult, PipelineStep, ReviewVerdict,
    StepStatus, TokenTotals,
};
use crate::arbiter::prompt::{
    CODEGEN_ITERATE, CODEGEN_SYSTEM, CODEGEN_USER, INTENT_SYSTEM, REVIEW_SYSTEM, REVIEW_USER,
};
use crate::arbiter::{LlmProvider, LlmProviderConfig, PromptManager};
use crate::capability_map::{CapabilityKind, CapabilityMap};
use crate::codeblocks::{parse_code_blocks, GeneratedCode};
use crate::error::{ForgeError, ForgeResult};
use crate::references::validate_references;

/// Upper bound on review-driven regenerations in one run.
pub const MAX_ITERATIONS: u32 = 3;

#[derive(Debug, Default)]
struct RunState {
    tokens: TokenTotals,
    codegen_passes: u32,
}

/// Feedback attached to a regeneration request.
struct Revision<'a> {
    previous: &'a GeneratedCode,
    feedback: String,
}

pub struct Pipeline {
    provider: Arc<dyn LlmProvider>,
    capability_map: Arc<CapabilityMap>,
    provider_config: LlmProviderConfig,
    prompts: PromptManager,
    progress: ProgressReporter,
}

impl Pipeline {
    pub fn new(provider: Arc<dyn LlmProvider>, capability_map: Arc<CapabilityMap>) -> Self {
        Self {
            provider,
            capability_map,
            provider_config: LlmProviderConfig::default(),
            prompts: PromptManager::default(),
            progress: ProgressReporter::silent(),
        }
    }

    pub fn with_provider_config(mut self, config: LlmProviderConfig) -> Self {
        self.provider_config = config;
        self
    }

    pub fn with_prompts(mut self, prompts: PromptManager) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn capability_map(&self) -> &CapabilityMap {
        &self.capability_map
    }

    /// Run the pipeline for one request. Never fails: every failure becomes
    /// [`PipelineResult::Error`] carrying the tokens spent so far.
    pub async fn run(&self, request: &str) -> PipelineResult {
        let provider = self.provider.info();
        log::info!("Pipeline run using {} ({})", provider.name, provider.model);
        let mut state = RunState::default();
        match self.execute(request, &mut state).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Pipeline run failed: {}", e);
                PipelineResult::Error {
                    message: e.to_string(),
                    iterations: state.codegen_passes,
                    tokens_used: state.tokens,
                }
            }
        }
    }

    async fn execute(&self, request: &str, state: &mut RunState) -> ForgeResult<PipelineResult> {
        self.capability_map.ensure_usable()?;

        let intent = match self.step_intent(request, state).await? {
            IntentOutcome::Clarification(clarification) => {
                log::info!("Request needs clarification: {}", clarification.question);
                return Ok(PipelineResult::Clarification {
                    question: clarification.question,
                    options: clarification.options,
                    reasoning: clarification.reasoning,
                    tokens_used: state.tokens,
                });
            }
            IntentOutcome::Intent(intent) => intent,
            IntentOutcome::Unparsable(raw) => {
                log::warn!("Intent response had no usable JSON object; using free-form intent");
                Intent::free_form(&raw)
            }
        };
        self.warn_on_undeclared_references(&intent);

        let mut code = self.step_codegen(request, &intent, None, state).await?;
        if !code.is_usable() {
            return Err(ForgeError::Generation(
                "Code generation produced no markup; the response contained no ```html block"
                    .to_string(),
            ));
        }

        let mut iteration = 0;
        loop {
            let verdict = self.step_review(request, &code, state).await?;
            let blocking = verdict.blocking_issues();
            if blocking.is_empty() {
                break;
            }
            if iteration >= MAX_ITERATIONS {
                log::warn!(
                    "Review still failing after {} iterations ({} errors); accepting current code",
                    iteration,
                    blocking.len()
                );
                break;
            }
            iteration += 1;

            self.progress.report(PipelineStep::Iterate, StepStatus::Running);
            let feedback = format_feedback(&blocking);
            log::info!(
                "Iteration {}/{}: regenerating to fix {} error(s)",
                iteration,
                MAX_ITERATIONS,
                blocking.len()
            );
            self.progress.report(PipelineStep::Iterate, StepStatus::Done);

            let revision = Revision {
                previous: &code,
                feedback,
            };
            code = self
                .step_codegen(request, &intent, Some(revision), state)
                .await?;
        }

        self.step_resolve(code, state).map(PipelineResult::Success)
    }

    fn finish<T>(&self, step: PipelineStep, result: &ForgeResult<T>) {
        let status = if result.is_ok() {
            StepStatus::Done
        } else {
            StepStatus::Failed
        };
        self.progress.report(step, status);
    }

    async fn generate(
        &self,
        prompt: &str,
        system_prompt: &str,
        state: &mut RunState,
    ) -> ForgeResult<String> {
        log::debug!("LLM system prompt:\n{}\nLLM prompt:\n{}", system_prompt, prompt);
        let completion = self
            .provider
            .call(prompt, system_prompt, &self.provider_config)
            .await?;
        state.tokens.add(&completion.tokens_used);
        log::debug!("LLM response:\n{}", completion.text);
        Ok(completion.text)
    }

    async fn step_intent(&self, request: &str, state: &mut RunState) -> ForgeResult<IntentOutcome> {
        self.progress.report(PipelineStep::Intent, StepStatus::Running);
        let result = self.interpret(request, state).await;
        self.finish(PipelineStep::Intent, &result);
        result
    }

    async fn interpret(&self, request: &str, state: &mut RunState) -> ForgeResult<IntentOutcome> {
        let mut vars = HashMap::new();
        vars.insert("capabilities", self.capability_map.render_for_prompt());
        let system = self.prompts.render(INTENT_SYSTEM, &vars)?;

        let text = self.generate(request, &system, state).await?;
        Ok(parse_intent(&text))
    }

    async fn step_codegen(
        &self,
        request: &str,
        intent: &Intent,
        revision: Option<Revision<'_>>,
        state: &mut RunState,
    ) -> ForgeResult<GeneratedCode> {
        self.progress.report(PipelineStep::Codegen, StepStatus::Running);
        let result = self.generate_code(request, intent, revision, state).await;
        self.finish(PipelineStep::Codegen, &result);
        result
    }

    async fn generate_code(
        &self,
        request: &str,
        intent: &Intent,
        revision: Option<Revision<'_>>,
        state: &mut RunState,
    ) -> ForgeResult<GeneratedCode> {
        let mut vars = self.reference_vars();
        vars.insert("capabilities", self.capability_map.render_for_prompt());
        vars.insert("intent", serde_json::to_string_pretty(intent)?);
        vars.insert("request", request.to_string());
        let system = self.prompts.render(CODEGEN_SYSTEM, &vars)?;

        let prompt = match &revision {
            Some(revision) => {
                vars.insert("markup", revision.previous.markup.clone());
                vars.insert("styles", revision.previous.styles.clone());
                vars.insert("script", revision.previous.script.clone());
                vars.insert("feedback", revision.feedback.clone());
                self.prompts.render(CODEGEN_ITERATE, &vars)?
            }
            None => self.prompts.render(CODEGEN_USER, &vars)?,
        };

        state.codegen_passes += 1;
        let text = self.generate(&prompt, &system, state).await?;
        Ok(parse_code_blocks(&text))
    }

    async fn step_review(
        &self,
        request: &str,
        code: &GeneratedCode,
        state: &mut RunState,
    ) -> ForgeResult<ReviewVerdict> {
        self.progress.report(PipelineStep::Review, StepStatus::Running);
        let result = self.review(request, code, state).await;
        self.finish(PipelineStep::Review, &result);
        result
    }

    async fn review(
        &self,
        request: &str,
        code: &GeneratedCode,
        state: &mut RunState,
    ) -> ForgeResult<ReviewVerdict> {
        let mut vars = self.reference_vars();
        let system = self.prompts.render(REVIEW_SYSTEM, &vars)?;
        vars.insert("request", request.to_string());
        vars.insert("markup", code.markup.clone());
        vars.insert("styles", code.styles.clone());
        vars.insert("script", code.script.clone());
        let prompt = self.prompts.render(REVIEW_USER, &vars)?;

        let text = self.generate(&prompt, &system, state).await?;
        let verdict = parse_review(&text).into_verdict();
        log::info!(
            "Review verdict {:?} with {} issue(s){}",
            verdict.verdict,
            verdict.issues.as_ref().map(Vec::len).unwrap_or(0),
            if verdict.notes.is_empty() {
                String::new()
            } else {
                format!(": {}", verdict.notes)
            }
        );
        Ok(verdict)
    }

    fn step_resolve(
        &self,
        code: GeneratedCode,
        state: &RunState,
    ) -> ForgeResult<GeneratedFragment> {
        self.progress.report(PipelineStep::Resolve, StepStatus::Running);
        if !code.is_usable() {
            self.progress.report(PipelineStep::Resolve, StepStatus::Failed);
            return Err(ForgeError::Generation(format!(
                "No usable markup after {} generation pass(es)",
                state.codegen_passes
            )));
        }

        let report = validate_references(&code.script, &self.capability_map);
        let mut reasoning = code.reasoning;
        if !report.is_valid() {
            let unknown = report.unknown_names().join(", ");
            log::warn!("Accepted code references unknown capabilities: {}", unknown);
            if !reasoning.is_empty() {
                reasoning.push_str("\n\n");
            }
            reasoning.push_str(&format!(
                "Warning: the generated code references unknown capabilities ({}); those calls will be rejected at runtime.",
                unknown
            ));
        }
        self.progress.report(PipelineStep::Resolve, StepStatus::Done);

        Ok(GeneratedFragment {
            markup: code.markup,
            styles: code.styles,
            script: code.script,
            reasoning,
            api_bindings: report.bindings,
            iterations: state.codegen_passes,
            tokens_used: state.tokens,
        })
    }

    fn reference_vars(&self) -> HashMap<&'static str, String> {
        let mut vars = HashMap::new();
        vars.insert(
            "queries",
            self.capability_map.reference_names(CapabilityKind::Query),
        );
        vars.insert(
            "actions",
            self.capability_map.reference_names(CapabilityKind::Action),
        );
        vars
    }

    fn warn_on_undeclared_references(&self, intent: &Intent) {
        for name in &intent.queries {
            if self.capability_map.query(name).is_none() {
                log::warn!("Intent names unknown query '{}'", name);
            }
        }
        for name in &intent.actions {
            if self.capability_map.action(name).is_none() {
                log::warn!("Intent names unknown action '{}'", name);
            }
        }
    }
}

/// One line per error-severity issue.
pub fn format_feedback(issues: &[&Issue]) -> String {
    issues
        .iter()
        .map(|issue| issue.feedback_line())
        .collect::<Vec<_>>()
        .join("\n")
}
