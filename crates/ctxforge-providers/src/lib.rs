//! # ctxforge-providers
//!
//! The thin LLM transport contract that `ctxforge-session`'s summarizer
//! depends on. Vendor HTTP/SSE adapters are an external concern and are
//! not implemented here — this crate only defines the interface plus an
//! in-memory mock for tests.

pub mod traits;

pub use traits::{
    as_model_metadata_provider, ChatClient, ChatRequest, ChatResponse, ChatStream, ConnectionReset,
    FinishReason, MockChatClient, ModelMetadataProvider, StreamEvent, ToolCallDelta, Usage,
};
