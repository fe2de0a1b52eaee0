//! The narrow LLM chat transport contract the compaction engine depends on.
//!
//! Real vendor adapters (HTTP/SSE, retries, header/body size limits) are out
//! of scope for this crate — only the contract and a couple of test doubles
//! live here. The compaction core treats any `Err` returned by `chat` as a
//! summarization failure and never inspects transport-level detail.

use std::any::Any;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use ctxforge_core::{Message, ToolCall};

/// A single chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

/// Reason a completion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ToolUse,
    ContentFilter,
}

/// Token usage reported by the backend, when available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Response to a non-streaming chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

/// A single event in a streaming chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Content { delta: String },
    ToolCall { index: u32, delta: ToolCallDelta },
    Thinking { delta: String },
    Done { usage: Option<Usage>, finish_reason: FinishReason },
    Error { message: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

pub type ChatStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// The only interface the compaction core depends on directly.
#[async_trait]
pub trait ChatClient: Any + Send + Sync {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream>;

    /// Support for downcasting to concrete provider types when a caller needs
    /// more than the capability traits below expose.
    fn as_any(&self) -> &dyn Any;

    /// Optional capability: overridden by providers that can report a
    /// model's context window / max output tokens, so the orchestration
    /// layer can rescale compaction budgets via `CompactionConfig::for_model`.
    /// Default `None` — most providers don't implement this.
    fn as_model_metadata_provider(&self) -> Option<&dyn ModelMetadataProvider> {
        None
    }

    /// Optional capability: overridden by providers that support explicit
    /// connection lifecycle control. Default `None`.
    fn as_connection_reset(&self) -> Option<&dyn ConnectionReset> {
        None
    }
}

/// Optional capability: reports a model's context window, in tokens.
pub trait ModelMetadataProvider {
    fn context_window(&self, model: &str) -> Option<u32>;
    fn max_output_tokens(&self, model: &str) -> Option<u32>;
}

/// Optional capability: transport-level connection lifecycle control.
pub trait ConnectionReset {
    fn reset_connections(&self);
    fn reset_session(&self, conversation_id: &str);
}

/// Detect whether a `ChatClient` also implements `ModelMetadataProvider`.
/// Thin forwarding wrapper kept for call sites that prefer a free function
/// over the trait method.
pub fn as_model_metadata_provider(client: &dyn ChatClient) -> Option<&dyn ModelMetadataProvider> {
    client.as_model_metadata_provider()
}

/// An in-memory chat client for tests and examples. Returns a fixed
/// response, or replays a queue of canned responses when provided.
pub struct MockChatClient {
    responses: std::sync::Mutex<std::collections::VecDeque<anyhow::Result<ChatResponse>>>,
    default_context_window: u32,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            default_context_window: 200_000,
        }
    }

    pub fn with_context_window(mut self, window: u32) -> Self {
        self.default_context_window = window;
        self
    }

    pub fn queue_response(&self, content: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(ChatResponse {
            content: content.into(),
            tool_calls: vec![],
            usage: None,
            finish_reason: FinishReason::Stop,
        }));
    }

    pub fn queue_error(&self, message: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!(message.into())));
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(&self, _req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut queue = self.responses.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(ChatResponse {
                content: String::new(),
                tool_calls: vec![],
                usage: None,
                finish_reason: FinishReason::Stop,
            }),
        }
    }

    async fn chat_stream(&self, req: ChatRequest) -> anyhow::Result<ChatStream> {
        let resp = self.chat(req).await?;
        let events = vec![
            StreamEvent::Content { delta: resp.content },
            StreamEvent::Done {
                usage: resp.usage,
                finish_reason: resp.finish_reason,
            },
        ];
        Ok(Box::pin(futures::stream::iter(events)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_model_metadata_provider(&self) -> Option<&dyn ModelMetadataProvider> {
        Some(self)
    }
}

impl ModelMetadataProvider for MockChatClient {
    fn context_window(&self, _model: &str) -> Option<u32> {
        Some(self.default_context_window)
    }

    fn max_output_tokens(&self, _model: &str) -> Option<u32> {
        Some(4_096)
    }
}
