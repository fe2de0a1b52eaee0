//! C7 — Compaction Policy.
//!
//! Decides whether compaction is needed, attempts summarization, and falls
//! back to mechanical truncation when summarization is unavailable or
//! fails. Owns the per-session compaction counters used for
//! `SessionMetrics::compaction_count`.

use std::collections::HashMap;

use ctxforge_core::{CompactionConfig, Message, Role};
use ctxforge_providers::ChatClient;
use parking_lot::RwLock;
use thiserror::Error;

use crate::budget::safe_prefix;
use crate::cutpoint::find_cut;
use crate::sanitize::sanitize;
use crate::summarize::summarize;
use crate::tokens::estimate_messages;
use crate::truncate::truncate;

const PREVIOUS_SUMMARY_PREFIX: &str = "[Previous conversation summary]\n";
const DROPPED_CONTEXT_NOTICE: &str = "[Earlier context was truncated to stay within the token budget.]";
const TOOL_RESULT_TRUNCATION_SUFFIX: &str = "[... truncated ...]";

#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("no chat client configured for summarization")]
    NoProvider,
    #[error("too few messages to compact ({0} available)")]
    MessagesTooShort(usize),
    #[error("summary generation failed: {0}")]
    SummaryFailed(#[from] ctxforge_core::Error),
    #[error("persisting the compacted context failed: {0}")]
    PersistenceFailed(String),
}

/// Outcome of a single compaction attempt.
///
/// `kept` is `system_count` untouched system messages, followed by
/// `notice_count` synthetic messages with no counterpart in the raw message
/// log (a summary or a dropped-context notice), followed by the real kept
/// conversation tail. Callers matching `kept` back to raw log ids must skip
/// the first `system_count + notice_count` entries.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub kept: Vec<Message>,
    pub used_summarizer: bool,
    pub system_count: usize,
    pub notice_count: usize,
}

/// Tracks how many times each session has been compacted, guarded for
/// concurrent access from multiple in-flight turns of the same session.
#[derive(Default)]
pub struct CompactionCounters {
    counts: RwLock<HashMap<String, u32>>,
}

impl CompactionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str) -> u32 {
        let mut counts = self.counts.write();
        let entry = counts.entry(session_id.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn get(&self, session_id: &str) -> u32 {
        self.counts.read().get(session_id).copied().unwrap_or(0)
    }

    /// Reset a session's counter at the start of a new user task, so the
    /// next compaction within that task summarizes again rather than
    /// inheriting the truncate-only posture of the previous task's later
    /// rounds.
    pub fn reset(&self, session_id: &str) {
        self.counts.write().remove(session_id);
    }
}

/// Whether the sanitized message set has crossed the configured trigger
/// threshold (by token count or raw message count, whichever is tighter).
pub fn needs_compaction(messages: &[Message], config: &CompactionConfig) -> bool {
    if messages.len() > config.max_message_count {
        return true;
    }
    estimate_messages(messages) > config.token_threshold()
}

/// Whether the caller should be signaled to inject a "save important
/// memories" turn ahead of the hard compaction trigger: true iff
/// memory-flush is enabled and the message list's token count has already
/// crossed `token_threshold - soft_threshold_tokens`.
pub fn needs_memory_flush(messages: &[Message], config: &CompactionConfig) -> bool {
    if !config.memory_flush_enabled {
        return false;
    }
    let soft_threshold = config.token_threshold().saturating_sub(config.soft_threshold_tokens);
    estimate_messages(messages) > soft_threshold
}

/// Scan `conversation` for the first user-or-assistant message carrying an
/// embedded previous summary (inserted by a prior compaction round's
/// `make_summary_message`), and return its content with the marker prefix
/// stripped. The Context Manager re-inserts this message at the head of the
/// rehydrated working set on every turn, so it normally falls within the
/// range being summarized away.
fn detect_previous_summary(conversation: &[Message]) -> Option<String> {
    conversation
        .iter()
        .find(|m| {
            (m.role == Role::Assistant || m.role == Role::User)
                && m.content.starts_with(PREVIOUS_SUMMARY_PREFIX)
        })
        .map(|m| m.content.strip_prefix(PREVIOUS_SUMMARY_PREFIX).unwrap_or(&m.content).to_string())
}

/// Truncate any tool-role message content exceeding
/// `config.compacted_tool_result_max_bytes`, leaving everything else
/// untouched. Applied to the kept tail after a compaction round — the Byte
/// Budgeter (C3) handles the outgoing request separately, but a kept tool
/// result that's merely large (not over the request byte budget) would
/// otherwise ride along unbounded across every subsequent compaction round.
fn cap_tool_result_bytes(messages: Vec<Message>, max_bytes: usize) -> Vec<Message> {
    messages
        .into_iter()
        .map(|mut m| {
            if m.role == Role::Tool && m.content.len() > max_bytes {
                let prefix = safe_prefix(&m.content, max_bytes);
                m.content = format!("{prefix}{TOOL_RESULT_TRUNCATION_SUFFIX}");
                m.token_count = None;
            }
            m
        })
        .collect()
}

/// Pick a role for the summary-notice message that avoids two consecutive
/// messages of the same role, based on whatever role the kept tail starts
/// with.
fn notice_role_for(next: Role) -> Role {
    if next == Role::Assistant {
        Role::User
    } else {
        Role::Assistant
    }
}

fn make_summary_message(summary: &str, next_role: Role) -> Message {
    let text = format!("{}{}", PREVIOUS_SUMMARY_PREFIX, summary);
    match notice_role_for(next_role) {
        Role::Assistant => Message::assistant(text),
        _ => Message::user(text),
    }
}

/// Split a message list into its system messages (kept untouched, in order)
/// and the rest of the conversation, which is the only part compaction acts
/// on.
fn split_system(messages: &[Message]) -> (Vec<Message>, Vec<Message>) {
    messages.iter().cloned().partition(|m| m.role == Role::System)
}

/// Attempt compaction via the Summarizer; the caller is expected to have
/// already sanitized `messages`.
pub async fn compact(
    client: Option<&dyn ChatClient>,
    model: &str,
    messages: &[Message],
    config: &CompactionConfig,
) -> Result<CompactionOutcome, CompactionError> {
    let client = client.ok_or(CompactionError::NoProvider)?;

    let (system, conversation) = split_system(messages);
    if conversation.len() <= config.keep_recent_count {
        return Err(CompactionError::MessagesTooShort(conversation.len()));
    }

    let cut = find_cut(&conversation, config.reserve_tokens, config.keep_recent_count);
    if cut.keep_from == 0 {
        return Err(CompactionError::MessagesTooShort(conversation.len()));
    }

    let to_summarize = &conversation[..cut.keep_from];
    let previous_summary = detect_previous_summary(to_summarize);
    let kept_tail = sanitize(&conversation[cut.keep_from..]);
    let kept_tail = cap_tool_result_bytes(kept_tail, config.compacted_tool_result_max_bytes);

    let summary = summarize(client, model, to_summarize, previous_summary.as_deref(), config).await?;

    let system_count = system.len();
    let next_role = kept_tail.first().map(|m| m.role).unwrap_or(Role::User);
    let mut kept = system;
    kept.push(make_summary_message(&summary, next_role));
    kept.extend(kept_tail);

    Ok(CompactionOutcome {
        summary,
        kept,
        used_summarizer: true,
        system_count,
        notice_count: 1,
    })
}

/// Mechanical fallback: no model call, just the Truncator over the reserve
/// token budget, with the system block prepended untouched and an
/// explanatory notice inserted ahead of the kept tail.
pub fn truncate_only(messages: &[Message], config: &CompactionConfig) -> CompactionOutcome {
    let (system, conversation) = split_system(messages);
    let result = truncate(&conversation, config.token_threshold());
    let kept_tail = sanitize(&result.kept);
    let kept_tail = cap_tool_result_bytes(kept_tail, config.compacted_tool_result_max_bytes);

    let mut kept = system.clone();
    let notice_count = if kept_tail.is_empty() {
        0
    } else {
        let next_role = kept_tail.first().map(|m| m.role).unwrap_or(Role::User);
        kept.push(make_notice(DROPPED_CONTEXT_NOTICE, next_role));
        1
    };
    kept.extend(kept_tail);

    CompactionOutcome {
        summary: String::new(),
        kept,
        used_summarizer: false,
        system_count: system.len(),
        notice_count,
    }
}

fn make_notice(text: &str, next_role: Role) -> Message {
    match notice_role_for(next_role) {
        Role::Assistant => Message::assistant(text),
        _ => Message::user(text),
    }
}

fn has_conversation(messages: &[Message]) -> bool {
    messages.iter().any(|m| m.role == Role::User || m.role == Role::Assistant)
}

/// Compact with graceful degradation: try summarization, and fall back to
/// mechanical truncation on any failure (no provider, too few messages, a
/// failed model call, or a result with no surviving user/assistant turn)
/// rather than propagating the error to the caller. If even truncation
/// produces a conversation-less list, the original `messages` are returned
/// unchanged — "too many tokens" beats "no conversation at all".
pub async fn compact_with_fallback(
    client: Option<&dyn ChatClient>,
    model: &str,
    messages: &[Message],
    config: &CompactionConfig,
) -> CompactionOutcome {
    match compact(client, model, messages, config).await {
        Ok(outcome) if has_conversation(&outcome.kept) => return outcome,
        Ok(_) => {
            tracing::warn!("summarization produced no surviving conversation turn, falling back to truncation");
        }
        Err(err) => {
            tracing::warn!(error = %err, "summarization failed, falling back to mechanical truncation");
        }
    }

    let truncated = truncate_only(messages, config);
    if has_conversation(&truncated.kept) {
        return truncated;
    }

    tracing::warn!("mechanical truncation also produced no surviving conversation turn, returning input unchanged");
    CompactionOutcome {
        summary: String::new(),
        kept: messages.to_vec(),
        used_summarizer: false,
        system_count: messages.iter().filter(|m| m.role == Role::System).count(),
        notice_count: 0,
    }
}

/// Compact a session, gating the Summarizer behind how many times this
/// session has already compacted within the current task: the first
/// compaction in a task tries summarization with mechanical fallback, every
/// subsequent one in the same task goes straight to `truncate_only`. This
/// keeps later rounds cheap and avoids repeatedly round-tripping the same
/// stale history through the model.
pub async fn compact_for_session(
    client: Option<&dyn ChatClient>,
    model: &str,
    messages: &[Message],
    config: &CompactionConfig,
    prior_compactions_this_task: u32,
) -> CompactionOutcome {
    if prior_compactions_this_task == 0 {
        compact_with_fallback(client, model, messages, config).await
    } else {
        truncate_only(messages, config)
    }
}
