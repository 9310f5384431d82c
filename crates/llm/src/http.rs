//! HTTP chat completion providers.
//!
//! Two wire formats cover every vendor we talk to: the OpenAI-compatible
//! `/chat/completions` shape (OpenAI, Gemini, DeepSeek, local proxies) and
//! Anthropic's Messages API.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::provider::{ChatMessage, CompletionRequest, CompletionResponse, LlmError, LlmProvider, Role};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Request/response format spoken by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    OpenAiCompatible,
    AnthropicMessages,
}

impl WireFormat {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().starts_with("claude-") {
            Self::AnthropicMessages
        } else {
            Self::OpenAiCompatible
        }
    }
}

/// Vendor base URL implied by a model name. Unknown models go to OpenAI.
pub fn default_base_url(model: &str) -> &'static str {
    let m = model.to_lowercase();
    if m.starts_with("claude-") {
        "https://api.anthropic.com"
    } else if m.starts_with("gemini-") {
        "https://generativelanguage.googleapis.com/v1beta/openai"
    } else if m.starts_with("deepseek-") {
        "https://api.deepseek.com"
    } else {
        "https://api.openai.com/v1"
    }
}

pub(crate) fn client() -> reqwest::Client {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default()
}

/// Send a prepared request and decode a JSON body. 429 maps to `RateLimited`.
pub(crate) async fn send_json<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> Result<T, LlmError> {
    let resp = req.send().await.map_err(|e| LlmError::Unavailable(e.to_string()))?;
    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(LlmError::RateLimited);
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(LlmError::RequestFailed(format!("{status}: {body}")));
    }
    resp.json().await.map_err(|e| LlmError::RequestFailed(format!("bad response body: {e}")))
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(m: &'a ChatMessage) -> Self {
        Self { role: role_str(m.role), content: &m.content }
    }
}

// ── OpenAI-compatible ──

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatReply {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// ── Anthropic Messages ──

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct MessagesReply {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessagesUsage {
    input_tokens: u32,
    output_tokens: u32,
}

/// Chat completion over HTTP in either wire format.
pub struct HttpProvider {
    wire: WireFormat,
    model: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpProvider {
    /// `base_url` overrides the vendor default derived from the model name.
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        let base = base_url.unwrap_or_else(|| default_base_url(&model).to_owned());
        Self {
            wire: WireFormat::for_model(&model),
            model,
            client: client(),
            base_url: base.trim_end_matches('/').to_owned(),
            api_key,
        }
    }

    fn endpoint(&self) -> String {
        match self.wire {
            WireFormat::AnthropicMessages => format!("{}/v1/messages", self.base_url),
            WireFormat::OpenAiCompatible => format!("{}/chat/completions", self.base_url),
        }
    }

    async fn chat_completions(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = ChatBody {
            model: &self.model,
            messages: request.messages.iter().map(WireMessage::from).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let reply: ChatReply =
            send_json(self.client.post(self.endpoint()).bearer_auth(&self.api_key).json(&body)).await?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let (input_tokens, output_tokens) =
            reply.usage.map_or((0, 0), |u| (u.prompt_tokens, u.completion_tokens));
        Ok(CompletionResponse { content, input_tokens, output_tokens })
    }

    async fn messages(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // System turns are lifted to the top-level field; the last one wins.
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .last()
            .map(|m| m.content.clone());
        let body = MessagesBody {
            model: &self.model,
            max_tokens: request.max_tokens,
            system,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(WireMessage::from)
                .collect(),
            temperature: request.temperature,
        };
        let reply: MessagesReply = send_json(
            self.client
                .post(self.endpoint())
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body),
        )
        .await?;

        let content: String = reply
            .content
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect();
        let (input_tokens, output_tokens) =
            reply.usage.map_or((0, 0), |u| (u.input_tokens, u.output_tokens));
        Ok(CompletionResponse { content, input_tokens, output_tokens })
    }
}

impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.model
    }

    fn complete(
        &self,
        request: CompletionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<CompletionResponse, LlmError>> + Send + '_>> {
        tracing::debug!(model = %self.model, messages = request.messages.len(), "completion request");
        match self.wire {
            WireFormat::AnthropicMessages => Box::pin(self.messages(request)),
            WireFormat::OpenAiCompatible => Box::pin(self.chat_completions(request)),
        }
    }
}

/// Build a provider from `<model_env_key>`, `RAPPORT_LLM_API_KEY` and the
/// optional `RAPPORT_LLM_BASE_URL`. `None` when model or key is unset.
pub fn from_env_with_model_var(model_env_key: &str) -> Option<HttpProvider> {
    let model = std::env::var(model_env_key).ok()?;
    let api_key = std::env::var("RAPPORT_LLM_API_KEY").ok()?;
    let base_url = std::env::var("RAPPORT_LLM_BASE_URL").ok();
    Some(HttpProvider::new(model, api_key, base_url))
}

/// Reply-generation provider from `RAPPORT_LLM_MODEL`.
pub fn from_env() -> Option<HttpProvider> {
    from_env_with_model_var("RAPPORT_LLM_MODEL")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_claude_models_speak_messages() {
        assert_eq!(WireFormat::for_model("claude-sonnet-4-5"), WireFormat::AnthropicMessages);
        assert_eq!(WireFormat::for_model("Claude-3-opus"), WireFormat::AnthropicMessages);
        for m in ["gpt-4o", "gemini-2.0-flash", "deepseek-chat", "llama-3"] {
            assert_eq!(WireFormat::for_model(m), WireFormat::OpenAiCompatible, "{m}");
        }
    }

    #[test]
    fn vendor_base_urls() {
        assert_eq!(default_base_url("gemini-2.0-flash"), "https://generativelanguage.googleapis.com/v1beta/openai");
        assert_eq!(default_base_url("deepseek-chat"), "https://api.deepseek.com");
        assert_eq!(default_base_url("mistral-large"), "https://api.openai.com/v1");
    }

    #[test]
    fn endpoints() {
        let p = HttpProvider::new("gpt-4o".into(), "sk-test".into(), None);
        assert_eq!(p.endpoint(), "https://api.openai.com/v1/chat/completions");
        let p = HttpProvider::new("claude-sonnet-4-5".into(), "sk-ant".into(), None);
        assert_eq!(p.endpoint(), "https://api.anthropic.com/v1/messages");
        assert_eq!(p.name(), "claude-sonnet-4-5");
    }

    #[test]
    fn base_url_override_drops_trailing_slash() {
        let p = HttpProvider::new("gpt-4o".into(), "sk-test".into(), Some("https://proxy.local/v1/".into()));
        assert_eq!(p.endpoint(), "https://proxy.local/v1/chat/completions");
    }

    #[test]
    fn wire_messages_borrow_content() {
        let msgs = [ChatMessage::system("rules"), ChatMessage::user("hi")];
        let wire: Vec<WireMessage> = msgs.iter().map(WireMessage::from).collect();
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].content, "hi");
    }
}
