//! C8 — Context Store, plus the session index it lives alongside.
//!
//! SQLite holds session metadata and the versioned `contexts` log; raw
//! message bodies are append-only JSONL files on disk, one per session,
//! keeping the structured index separate from bulk log data.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use ctxforge_core::{CompactedContext, Message, ModelConfig, Session, SessionMetadata, SessionMetrics, SessionState};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("storage path error: {0}")]
    PathError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Default)]
pub struct SessionQuery {
    pub state: Option<SessionState>,
    pub limit: usize,
    pub offset: usize,
}

impl SessionQuery {
    pub fn new() -> Self {
        Self { limit: 50, ..Default::default() }
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub title: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub message_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedStats {
    pub session_count: u32,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost: f64,
    pub total_turns: u32,
    pub total_compactions: u32,
}

/// Session metadata + raw message log storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Session>;
    async fn get_metadata(&self, id: &str) -> Result<SessionMetadata>;
    async fn update_metadata(&self, metadata: &SessionMetadata) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, query: &SessionQuery) -> Result<Vec<SessionSummary>>;
    async fn get_most_recent(&self) -> Result<Option<SessionSummary>>;
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()>;
    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn set_state(&self, id: &str, state: SessionState) -> Result<()>;
    async fn touch(&self, id: &str) -> Result<()>;
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<SessionSummary>>;
    async fn get_aggregated_stats(&self, since: Option<DateTime<Utc>>) -> Result<AggregatedStats>;
}

/// The versioned compacted-context log.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Persist a new version. Callers are expected to have set `version` to
    /// `max_version(session_id) + 1`; `UNIQUE(session_id, version)` rejects
    /// any attempt to reuse a version out from under a concurrent writer.
    async fn save(&self, context: &CompactedContext) -> Result<()>;
    async fn get_latest(&self, session_id: &str) -> Result<Option<CompactedContext>>;
    /// Return up to `limit` rows for `session_id`, most recent version first.
    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<CompactedContext>>;
    async fn max_version(&self, session_id: &str) -> Result<u32>;
}

pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
    sessions_dir: PathBuf,
}

impl SqliteSessionStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let sessions_dir = base_dir.join("sessions");
        fs::create_dir_all(&sessions_dir)?;

        let conn = Connection::open(base_dir.join("ctxforge.db"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self { conn: Mutex::new(conn), sessions_dir };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn open_default() -> Result<Self> {
        let data_dir = ctxforge_core::EngineConfig::data_dir();
        Self::new(data_dir)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current_version: i32 = conn
            .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| row.get(0))
            .unwrap_or(0);
        if current_version < 1 {
            let migration = include_str!("../migrations/001_initial.sql");
            conn.execute_batch(migration)?;
        }
        Ok(())
    }

    fn message_file_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.jsonl"))
    }

    fn state_to_str(state: SessionState) -> &'static str {
        match state {
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Archived => "archived",
        }
    }

    fn str_to_state(s: &str) -> SessionState {
        match s {
            "suspended" => SessionState::Suspended,
            "archived" => SessionState::Archived,
            _ => SessionState::Active,
        }
    }

    fn parse_datetime(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc)).unwrap_or_else(|_| Utc::now())
    }

    fn row_to_summary(row: &rusqlite::Row) -> rusqlite::Result<SessionSummary> {
        let state_str: String = row.get("state")?;
        let created_at: String = row.get("created_at")?;
        let last_active_at: String = row.get("last_active_at")?;
        Ok(SessionSummary {
            id: row.get("id")?,
            title: row.get("title")?,
            state: Self::str_to_state(&state_str),
            created_at: Self::parse_datetime(&created_at),
            last_active_at: Self::parse_datetime(&last_active_at),
            message_count: row.get("turn_count")?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let meta = &session.metadata;
        File::create(self.message_file_path(&meta.id))?;

        conn.execute(
            r#"INSERT INTO sessions
                (id, title, state, provider, model_id, context_window, created_at, updated_at,
                 last_active_at, total_tokens_in, total_tokens_out, total_cost, turn_count,
                 compaction_count)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"#,
            params![
                meta.id,
                meta.title,
                Self::state_to_str(meta.state),
                meta.model.provider,
                meta.model.model_id,
                meta.model.context_window,
                meta.created_at.to_rfc3339(),
                meta.updated_at.to_rfc3339(),
                meta.last_active_at.to_rfc3339(),
                meta.metrics.total_tokens_in,
                meta.metrics.total_tokens_out,
                meta.metrics.total_cost,
                meta.metrics.turn_count,
                meta.metrics.compaction_count,
            ],
        )?;

        drop(conn);
        for message in &session.messages {
            self.append_message(&meta.id, message).await?;
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Session> {
        let metadata = self.get_metadata(id).await?;
        let messages = self.get_messages(id).await?;
        Ok(Session { metadata, messages })
    }

    async fn get_metadata(&self, id: &str) -> Result<SessionMetadata> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"SELECT id, title, state, provider, model_id, context_window, created_at, updated_at,
                      last_active_at, total_tokens_in, total_tokens_out, total_cost, turn_count,
                      compaction_count
               FROM sessions WHERE id = ?1"#,
            params![id],
            |row| {
                let state_str: String = row.get("state")?;
                Ok(SessionMetadata {
                    id: row.get("id")?,
                    title: row.get("title")?,
                    state: Self::str_to_state(&state_str),
                    model: ModelConfig {
                        provider: row.get("provider")?,
                        model_id: row.get("model_id")?,
                        context_window: row.get("context_window")?,
                    },
                    created_at: Self::parse_datetime(&row.get::<_, String>("created_at")?),
                    updated_at: Self::parse_datetime(&row.get::<_, String>("updated_at")?),
                    last_active_at: Self::parse_datetime(&row.get::<_, String>("last_active_at")?),
                    metrics: SessionMetrics {
                        total_tokens_in: row.get("total_tokens_in")?,
                        total_tokens_out: row.get("total_tokens_out")?,
                        total_cost: row.get("total_cost")?,
                        turn_count: row.get("turn_count")?,
                        compaction_count: row.get("compaction_count")?,
                    },
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn update_metadata(&self, metadata: &SessionMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE sessions SET title = ?2, state = ?3, updated_at = ?4, last_active_at = ?5,
                 total_tokens_in = ?6, total_tokens_out = ?7, total_cost = ?8, turn_count = ?9,
                 compaction_count = ?10
               WHERE id = ?1"#,
            params![
                metadata.id,
                metadata.title,
                Self::state_to_str(metadata.state),
                metadata.updated_at.to_rfc3339(),
                metadata.last_active_at.to_rfc3339(),
                metadata.metrics.total_tokens_in,
                metadata.metrics.total_tokens_out,
                metadata.metrics.total_cost,
                metadata.metrics.turn_count,
                metadata.metrics.compaction_count,
            ],
        )?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        let path = self.message_file_path(id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn list(&self, query: &SessionQuery) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT id, title, state, created_at, last_active_at, turn_count FROM sessions",
        );
        if query.state.is_some() {
            sql.push_str(" WHERE state = ?1");
        }
        sql.push_str(" ORDER BY last_active_at DESC LIMIT ?2 OFFSET ?3");

        let mut stmt = conn.prepare(&sql)?;
        let limit = if query.limit == 0 { 50 } else { query.limit } as i64;
        let rows = match query.state {
            Some(state) => {
                stmt.query_map(params![Self::state_to_str(state), limit, query.offset as i64], Self::row_to_summary)?
            }
            None => stmt.query_map(params![limit, query.offset as i64], Self::row_to_summary)?,
        };
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_most_recent(&self) -> Result<Option<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, state, created_at, last_active_at, turn_count FROM sessions \
             ORDER BY last_active_at DESC LIMIT 1",
            [],
            Self::row_to_summary,
        )
        .optional()
        .map_err(StoreError::from)
    }

    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let line = serde_json::to_string(message)?;
        let path = self.message_file_path(session_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET turn_count = turn_count + 1, updated_at = ?2, last_active_at = ?2 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let path = self.message_file_path(session_id);
        if !path.exists() {
            return Ok(vec![]);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            messages.push(serde_json::from_str(&line)?);
        }
        Ok(messages)
    }

    async fn set_state(&self, id: &str, state: SessionState) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET state = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, Self::state_to_str(state), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn touch(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET last_active_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, state, created_at, last_active_at, turn_count FROM sessions \
             WHERE id LIKE ?1 ORDER BY last_active_at DESC",
        )?;
        let rows = stmt.query_map(params![format!("{prefix}%")], Self::row_to_summary)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn get_aggregated_stats(&self, since: Option<DateTime<Utc>>) -> Result<AggregatedStats> {
        let conn = self.conn.lock().unwrap();
        let to_stats = |row: &rusqlite::Row| -> rusqlite::Result<AggregatedStats> {
            Ok(AggregatedStats {
                session_count: row.get(0)?,
                total_tokens_in: row.get(1)?,
                total_tokens_out: row.get(2)?,
                total_cost: row.get(3)?,
                total_turns: row.get(4)?,
                total_compactions: row.get(5)?,
            })
        };
        let base_sql = "SELECT COUNT(*), COALESCE(SUM(total_tokens_in),0), COALESCE(SUM(total_tokens_out),0), \
                         COALESCE(SUM(total_cost),0), COALESCE(SUM(turn_count),0), COALESCE(SUM(compaction_count),0) \
                         FROM sessions";
        let stats = match since {
            Some(since) => conn.query_row(
                &format!("{base_sql} WHERE created_at >= ?1"),
                params![since.to_rfc3339()],
                to_stats,
            )?,
            None => conn.query_row(base_sql, [], to_stats)?,
        };
        Ok(stats)
    }
}

#[async_trait]
impl ContextStore for SqliteSessionStore {
    async fn save(&self, context: &CompactedContext) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let kept_ids_json = serde_json::to_string(&context.kept_message_ids)?;
        conn.execute(
            r#"INSERT INTO contexts
                (id, session_id, version, summary, kept_message_ids, total_tokens, original_tokens, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                context.id,
                context.session_id,
                context.version,
                context.summary,
                kept_ids_json,
                context.total_tokens,
                context.original_tokens,
                context.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "UPDATE sessions SET compaction_count = compaction_count + 1 WHERE id = ?1",
            params![context.session_id],
        )?;
        Ok(())
    }

    async fn get_latest(&self, session_id: &str) -> Result<Option<CompactedContext>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            r#"SELECT id, session_id, version, summary, kept_message_ids, total_tokens, original_tokens, created_at
               FROM contexts WHERE session_id = ?1 ORDER BY version DESC LIMIT 1"#,
            params![session_id],
            row_to_context,
        )
        .optional()
        .map_err(StoreError::from)
    }

    async fn list(&self, session_id: &str, limit: usize) -> Result<Vec<CompactedContext>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"SELECT id, session_id, version, summary, kept_message_ids, total_tokens, original_tokens, created_at
               FROM contexts WHERE session_id = ?1 ORDER BY version DESC LIMIT ?2"#,
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_context)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    async fn max_version(&self, session_id: &str) -> Result<u32> {
        let conn = self.conn.lock().unwrap();
        let version: u32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM contexts WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }
}

fn row_to_context(row: &rusqlite::Row) -> rusqlite::Result<CompactedContext> {
    let kept_ids_json: String = row.get("kept_message_ids")?;
    let created_at: String = row.get("created_at")?;
    Ok(CompactedContext {
        id: row.get("id")?,
        session_id: row.get("session_id")?,
        version: row.get("version")?,
        summary: row.get("summary")?,
        kept_message_ids: serde_json::from_str(&kept_ids_json).unwrap_or_default(),
        total_tokens: row.get("total_tokens")?,
        original_tokens: row.get("original_tokens")?,
        created_at: SqliteSessionStore::parse_datetime(&created_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::Message;

    fn temp_store() -> (tempfile::TempDir, SqliteSessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_and_get_round_trips_metadata() {
        let (_dir, store) = temp_store();
        let session = Session::new();
        store.create(&session).await.unwrap();
        let fetched = store.get(session.id()).await.unwrap();
        assert_eq!(fetched.metadata.id, session.metadata.id);
    }

    #[tokio::test]
    async fn append_and_get_messages_round_trips_jsonl() {
        let (_dir, store) = temp_store();
        let session = Session::new();
        store.create(&session).await.unwrap();
        store.append_message(session.id(), &Message::user("hi")).await.unwrap();
        store.append_message(session.id(), &Message::assistant("hello")).await.unwrap();
        let messages = store.get_messages(session.id()).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
    }

    #[tokio::test]
    async fn context_versions_are_strictly_increasing() {
        let (_dir, store) = temp_store();
        let session = Session::new();
        store.create(&session).await.unwrap();

        for v in 1..=3u32 {
            let mut ctx = CompactedContext::new(session.id());
            ctx.version = v;
            ctx.summary = format!("summary v{v}");
            store.save(&ctx).await.unwrap();
        }

        assert_eq!(store.max_version(session.id()).await.unwrap(), 3);
        let latest = store.get_latest(session.id()).await.unwrap().unwrap();
        assert_eq!(latest.version, 3);
        let listed = store.list(session.id(), 10).await.unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].version, 3);
        assert_eq!(listed[2].version, 1);

        let capped = store.list(session.id(), 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].version, 3);
    }

    #[tokio::test]
    async fn duplicate_version_is_rejected_by_unique_constraint() {
        let (_dir, store) = temp_store();
        let session = Session::new();
        store.create(&session).await.unwrap();
        let mut ctx = CompactedContext::new(session.id());
        ctx.version = 1;
        store.save(&ctx).await.unwrap();
        let mut dupe = CompactedContext::new(session.id());
        dupe.version = 1;
        assert!(store.save(&dupe).await.is_err());
    }

    #[tokio::test]
    async fn get_most_recent_orders_by_last_active() {
        let (_dir, store) = temp_store();
        let a = Session::new();
        store.create(&a).await.unwrap();
        store.touch(a.id()).await.unwrap();
        let recent = store.get_most_recent().await.unwrap().unwrap();
        assert_eq!(recent.id, a.metadata.id);
    }
}
