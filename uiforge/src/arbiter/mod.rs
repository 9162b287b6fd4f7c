//! Text-generation layer: provider abstraction and prompt templates.

pub mod llm_provider;
pub mod prompt;

pub use llm_provider::{
    create_provider, AnthropicProvider, Completion, LlmProvider, LlmProviderConfig,
    LlmProviderInfo, LlmProviderType, OpenAiProvider, RecordedCall, StubProvider, TokenUsage,
};
pub use prompt::{BuiltinPromptStore, FilePromptStore, PromptManager, PromptStore, PromptTemplate};
