//! C9 — Context Manager.
//!
//! The public facade: rehydrates a session's working message list from the
//! raw log plus the latest persisted `CompactedContext`, sanitizes it, and
//! compacts it again if it has grown past the configured trigger.

use std::sync::Arc;

use ctxforge_core::{CompactedContext, CompactionConfig, Error, Message, Result, Role};
use ctxforge_providers::ChatClient;

use crate::budget::{self, DEFAULT_PROTECTED_TAIL};
use crate::policy::{self, CompactionCounters};
use crate::sanitize::sanitize;
use crate::store::{ContextStore, SessionStore};
use crate::tokens::estimate_messages;

pub struct ContextManager<St> {
    store: Arc<St>,
    client: Option<Arc<dyn ChatClient>>,
    model: String,
    config: CompactionConfig,
    counters: CompactionCounters,
}

/// The assembled request: system prompt, sanitized+budgeted history, and
/// the caller's new input, ready to hand to a `ChatClient`.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub messages: Vec<Message>,
    pub estimated_tokens: u32,
    pub estimated_bytes: usize,
    pub compacted: bool,
}

impl<St> ContextManager<St>
where
    St: SessionStore + ContextStore,
{
    pub fn new(
        store: Arc<St>,
        client: Option<Arc<dyn ChatClient>>,
        model: impl Into<String>,
        config: CompactionConfig,
    ) -> Self {
        Self { store, client, model: model.into(), config, counters: CompactionCounters::new() }
    }

    /// Rehydrate a session's working message list from the raw log plus the
    /// latest compacted context, dropping any leading tool-result message
    /// that would otherwise open the window mid tool_call/result pair.
    async fn rehydrate(&self, session_id: &str) -> Result<Vec<Message>> {
        let raw = self
            .store
            .get_messages(session_id)
            .await
            .map_err(|e| Error::Session(e.to_string()))?;

        let latest = self
            .store
            .get_latest(session_id)
            .await
            .map_err(|e| Error::Session(e.to_string()))?;

        let Some(context) = latest else {
            return Ok(raw);
        };

        let kept_ids: std::collections::HashSet<&str> =
            context.kept_message_ids.iter().map(|s| s.as_str()).collect();

        // The raw log is append-only and `kept_message_ids` names a
        // contiguous suffix of it as of that compaction round, so everything
        // from the *first* kept id through the end of the log belongs in the
        // working set: the kept tail itself (verbatim) plus whatever turns
        // have been appended since.
        let mut started = false;
        let mut tail: Vec<Message> = Vec::new();
        for message in &raw {
            if !started && kept_ids.contains(message.id.as_str()) {
                started = true;
            }
            if started {
                tail.push(message.clone());
            }
        }

        let summary_role = tail.first().map(|m| m.role).unwrap_or(Role::User);
        let notice_role = if summary_role == Role::Assistant { Role::User } else { Role::Assistant };
        let summary_message = match notice_role {
            Role::Assistant => Message::assistant(format!("[Previous conversation summary]\n{}", context.summary)),
            _ => Message::user(format!("[Previous conversation summary]\n{}", context.summary)),
        };

        let mut rehydrated = vec![summary_message];
        rehydrated.extend(tail);

        // Drop a leading orphan tool result: the kept-id cursor can land
        // inside a tool_call/result group.
        while rehydrated.get(1).map(|m| m.role) == Some(Role::Tool) {
            rehydrated.remove(1);
        }

        Ok(rehydrated)
    }

    /// Mark the start of a new user task for `session_id`, resetting its
    /// compaction counter so the next compaction (if any) within this task
    /// summarizes again rather than inheriting the truncate-only posture a
    /// prior task may have driven the counter into.
    pub fn begin_task(&self, session_id: &str) {
        self.counters.reset(session_id);
    }

    /// The compaction config to use for this turn: `self.config` as configured,
    /// rescaled via `CompactionConfig::for_model` when the bound client exposes
    /// `ModelMetadataProvider` and reports a context window for `self.model`.
    fn effective_config(&self) -> CompactionConfig {
        let window = self
            .client
            .as_deref()
            .and_then(|c| c.as_model_metadata_provider())
            .and_then(|p| p.context_window(&self.model));
        match window {
            Some(window) if window > 0 => self.config.for_model(window),
            _ => self.config.clone(),
        }
    }

    /// Run a fresh compaction round over `messages`, persist the resulting
    /// `CompactedContext`, and return the new working message list.
    ///
    /// The first compaction within a task tries the Summarizer (falling back
    /// to mechanical truncation on failure); every subsequent compaction in
    /// the same task goes straight to mechanical truncation.
    async fn do_compression(&self, session_id: &str, messages: &[Message], config: &CompactionConfig) -> Result<Vec<Message>> {
        let original_tokens = estimate_messages(messages);
        let prior_compactions = self.counters.get(session_id);
        let outcome = policy::compact_for_session(
            self.client.as_deref(),
            &self.model,
            messages,
            config,
            prior_compactions,
        )
        .await;

        self.counters.record(session_id);

        let kept_message_ids: Vec<String> = outcome
            .kept
            .iter()
            .skip(outcome.system_count + outcome.notice_count)
            .map(|m| m.id.clone())
            .collect();

        let next_version = self
            .store
            .max_version(session_id)
            .await
            .map_err(|e| Error::Session(e.to_string()))?
            + 1;

        let mut context = CompactedContext::new(session_id);
        context.version = next_version;
        context.summary = outcome.summary.clone();
        context.kept_message_ids = kept_message_ids;
        context.total_tokens = estimate_messages(&outcome.kept);
        context.original_tokens = original_tokens;

        self.store.save(&context).await.map_err(|e| Error::Session(e.to_string()))?;

        Ok(outcome.kept)
    }

    /// Assemble the final request for a turn: rehydrate, sanitize, compact
    /// if needed, append the new turn, and fit the byte budget.
    pub async fn build_context(
        &self,
        session_id: &str,
        system_prompt: &str,
        user_input: &str,
    ) -> Result<BuiltContext> {
        let config = self.effective_config();

        let rehydrated = self.rehydrate(session_id).await?;
        let mut working = sanitize(&rehydrated);

        let mut compacted = false;
        if policy::needs_compaction(&working, &config) {
            working = self.do_compression(session_id, &working, &config).await?;
            compacted = true;
        }

        let mut messages = vec![Message::system(system_prompt)];
        messages.extend(working);
        messages.push(Message::user(user_input));

        let budgeted = budget::budget(&messages, 0, config.max_request_bytes, DEFAULT_PROTECTED_TAIL);

        Ok(BuiltContext {
            estimated_tokens: estimate_messages(&budgeted.messages),
            estimated_bytes: budgeted.estimated_bytes,
            messages: budgeted.messages,
            compacted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteSessionStore;
    use ctxforge_core::Session;
    use ctxforge_providers::MockChatClient;

    async fn seeded_store() -> (tempfile::TempDir, Arc<SqliteSessionStore>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteSessionStore::new(dir.path()).unwrap());
        let session = Session::new();
        let id = session.metadata.id.clone();
        store.create(&session).await.unwrap();
        (dir, store, id)
    }

    #[tokio::test]
    async fn build_context_round_trips_without_compaction() {
        let (_dir, store, id) = seeded_store().await;
        store.append_message(&id, &Message::user("hello")).await.unwrap();
        store.append_message(&id, &Message::assistant("hi there")).await.unwrap();

        let manager = ContextManager::new(store, None, "test-model", CompactionConfig::default());
        let built = manager.build_context(&id, "be helpful", "what's next?").await.unwrap();

        assert_eq!(built.messages.first().unwrap().role, Role::System);
        assert_eq!(built.messages.last().unwrap().content, "what's next?");
        assert!(!built.compacted);
    }

    #[tokio::test]
    async fn compacts_when_message_count_exceeds_ceiling() {
        let (_dir, store, id) = seeded_store().await;
        for i in 0..50 {
            store.append_message(&id, &Message::user(format!("turn {i}"))).await.unwrap();
        }

        let client = MockChatClient::new();
        client.queue_response("Goal: t\nProgress: t\nKey Decisions: t\nImportant Context: t\nOpen Issues: t");
        let config = CompactionConfig { max_message_count: 10, keep_recent_count: 4, ..CompactionConfig::default() };
        let manager = ContextManager::new(store.clone(), Some(Arc::new(client)), "test-model", config);

        let built = manager.build_context(&id, "sys", "next").await.unwrap();
        assert!(built.compacted);
        assert_eq!(store.max_version(&id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_compaction_in_same_task_skips_the_summarizer() {
        let (_dir, store, id) = seeded_store().await;
        for i in 0..10 {
            store.append_message(&id, &Message::user(format!("turn {i}"))).await.unwrap();
        }

        let client = MockChatClient::new();
        client.queue_response("Goal: t\nProgress: t\nKey Decisions: t\nImportant Context: t\nOpen Issues: t");
        let config = CompactionConfig { max_message_count: 5, keep_recent_count: 2, ..CompactionConfig::default() };
        let manager = ContextManager::new(store.clone(), Some(Arc::new(client)), "test-model", config);

        manager.build_context(&id, "sys", "first").await.unwrap();
        let first_context = store.get_latest(&id).await.unwrap().unwrap();
        assert!(!first_context.summary.is_empty());

        for i in 0..10 {
            store.append_message(&id, &Message::user(format!("more {i}"))).await.unwrap();
        }
        manager.build_context(&id, "sys", "second").await.unwrap();
        let second_context = store.get_latest(&id).await.unwrap().unwrap();
        assert_eq!(second_context.version, 2);
        assert!(second_context.summary.is_empty());
    }

    #[tokio::test]
    async fn begin_task_resets_counter_so_next_compaction_summarizes_again() {
        let (_dir, store, id) = seeded_store().await;
        for i in 0..10 {
            store.append_message(&id, &Message::user(format!("turn {i}"))).await.unwrap();
        }

        let client = MockChatClient::new();
        client.queue_response("Goal: t\nProgress: t\nKey Decisions: t\nImportant Context: t\nOpen Issues: t");
        let config = CompactionConfig { max_message_count: 5, keep_recent_count: 2, ..CompactionConfig::default() };
        let manager = ContextManager::new(store.clone(), Some(Arc::new(client)), "test-model", config);

        manager.build_context(&id, "sys", "first").await.unwrap();
        manager.begin_task(&id);

        for i in 0..10 {
            store.append_message(&id, &Message::user(format!("more {i}"))).await.unwrap();
        }
        client.queue_response("Goal: t2\nProgress: t2\nKey Decisions: t2\nImportant Context: t2\nOpen Issues: t2");
        manager.build_context(&id, "sys", "second").await.unwrap();
        let second_context = store.get_latest(&id).await.unwrap().unwrap();
        assert!(!second_context.summary.is_empty());
    }

    #[tokio::test]
    async fn restart_recovery_rehydrates_persisted_version() {
        let (_dir, store, id) = seeded_store().await;
        // A prefix that a prior compaction folded into the summary (not in
        // kept_message_ids): this content must NOT reappear verbatim.
        store.append_message(&id, &Message::user("summarized away 1")).await.unwrap();
        store.append_message(&id, &Message::assistant("summarized away 2")).await.unwrap();
        // The verbatim kept tail from that same compaction round.
        let kept1 = Message::user("kept tail turn one");
        let kept2 = Message::assistant("kept tail turn two");
        store.append_message(&id, &kept1).await.unwrap();
        store.append_message(&id, &kept2).await.unwrap();

        let mut ctx = CompactedContext::new(&id);
        ctx.version = 1;
        ctx.summary = "earlier work was done".to_string();
        ctx.kept_message_ids = vec![kept1.id.clone(), kept2.id.clone()];
        store.save(&ctx).await.unwrap();

        store.append_message(&id, &Message::user("third, after restart")).await.unwrap();

        let manager = ContextManager::new(store, None, "test-model", CompactionConfig::default());
        let built = manager.build_context(&id, "sys", "continue").await.unwrap();

        assert!(built.messages.iter().any(|m| m.content.contains("earlier work was done")));
        // The kept verbatim tail from the prior compaction must survive
        // rehydration, not just the summary and the new post-restart turn.
        assert!(built.messages.iter().any(|m| m.content == "kept tail turn one"));
        assert!(built.messages.iter().any(|m| m.content == "kept tail turn two"));
        assert!(built.messages.iter().any(|m| m.content == "third, after restart"));
        assert!(built.messages.iter().all(|m| m.content != "summarized away 1"));
        assert!(built.messages.iter().all(|m| m.content != "summarized away 2"));
    }

    #[tokio::test]
    async fn context_window_rescale_adapts_budgets_when_metadata_provider_reports_it() {
        let (_dir, store, id) = seeded_store().await;
        for i in 0..50 {
            store.append_message(&id, &Message::user(format!("turn {i}"))).await.unwrap();
        }

        let client = MockChatClient::new().with_context_window(200_000);
        client.queue_response("Goal: t\nProgress: t\nKey Decisions: t\nImportant Context: t\nOpen Issues: t");
        // With the default 48k baseline, a 200k window scales max_message_count
        // by ~4.17x * 2.5 (super-linear), so 50 messages should no longer need
        // compaction once rescaled, even though max_message_count=10 would
        // trigger it unscaled.
        let config = CompactionConfig { max_message_count: 10, keep_recent_count: 4, ..CompactionConfig::default() };
        let manager = ContextManager::new(store.clone(), Some(Arc::new(client)), "test-model", config);

        let built = manager.build_context(&id, "sys", "next").await.unwrap();
        assert!(!built.compacted);
    }
}
