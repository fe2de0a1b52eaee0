//! # ctxforge-core
//!
//! Core data model, configuration, and error types shared by the ctxforge
//! context manager and compaction engine.
//!
//! This crate provides:
//! - Message and tool-call primitives (`message`)
//! - Session identity and the versioned compacted-context record (`session`)
//! - The compaction configuration surface and its model-window adaptation (`config`)
//! - The crate-wide error type (`error`)

pub mod config;
pub mod error;
pub mod message;
pub mod session;

pub use config::{CompactionConfig, EngineConfig};
pub use error::{Error, Result};
pub use message::{FunctionCall, Message, Role, ToolCall};
pub use session::{CompactedContext, ModelConfig, Session, SessionMetadata, SessionMetrics, SessionState};
