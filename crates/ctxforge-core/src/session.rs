//! Session and persisted-context record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::Message;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Suspended,
    Archived,
}

/// Usage metrics accumulated across a session's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost: f64,
    pub turn_count: u32,
    pub compaction_count: u32,
}

/// Model configuration attached to a session, used by the context-window
/// adaptation function when a model reports a larger window than the
/// default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    pub model_id: String,
    pub context_window: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model_id: "claude-sonnet-4-20250514".to_string(),
            context_window: 200_000,
        }
    }
}

/// Session metadata, independent of the raw message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub state: SessionState,
    pub title: Option<String>,
    pub metrics: SessionMetrics,
    pub model: ModelConfig,
}

impl SessionMetadata {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            last_active_at: now,
            state: SessionState::Active,
            title: None,
            metrics: SessionMetrics::default(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// A session: identity plus its raw, append-only message log.
///
/// The compacted view (summary + kept ids) is *not* stored here — it lives
/// in the versioned `contexts` table owned by the context store and is
/// assembled back into a message list by the context manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub metadata: SessionMetadata,
    pub messages: Vec<Message>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            metadata: SessionMetadata::new(),
            messages: vec![],
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.metadata.metrics.turn_count += 1;
        self.metadata.updated_at = Utc::now();
        self.metadata.last_active_at = Utc::now();
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// A versioned, persisted compacted-context record.
///
/// Ownership: the Context Store exclusively owns these records; every other
/// component receives read-only copies. `kept_message_ids` is an id-only
/// back-reference into the raw message log — never a shared ownership edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactedContext {
    pub id: String,
    pub session_id: String,
    pub version: u32,
    pub summary: String,
    pub kept_message_ids: Vec<String>,
    pub total_tokens: u32,
    pub original_tokens: u32,
    pub created_at: DateTime<Utc>,
}

impl CompactedContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            version: 0,
            summary: String::new(),
            kept_message_ids: vec![],
            total_tokens: 0,
            original_tokens: 0,
            created_at: Utc::now(),
        }
    }
}
