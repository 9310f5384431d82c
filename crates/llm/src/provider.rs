use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// LLM completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// LLM completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Error type for LLM operations.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited")]
    RateLimited,
    #[error("request failed: {0}")]
    RequestFailed(String),
}

/// Trait for chat completion providers (OpenAI, Claude, Gemini, etc.)
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>>;
}

/// Mock provider for testing. Returns a fixed response, or fails every call.
#[derive(Debug, Clone)]
pub struct MockProvider {
    pub response: String,
    pub fail: bool,
}

impl MockProvider {
    pub fn new(response: impl Into<String>) -> Self {
        Self { response: response.into(), fail: false }
    }

    /// A provider whose every call returns `LlmError::Unavailable`.
    pub fn failing() -> Self {
        Self { response: String::new(), fail: true }
    }
}

impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn complete(
        &self,
        _request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        let content = self.response.clone();
        let fail = self.fail;
        Box::pin(async move {
            if fail {
                return Err(LlmError::Unavailable("mock configured to fail".into()));
            }
            Ok(CompletionResponse { content, input_tokens: 10, output_tokens: 20 })
        })
    }
}
