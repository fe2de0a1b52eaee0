//! Session recovery: resuming, locating, and validating sessions across
//! process restarts. Builds on top of `ContextStore`'s persisted-version
//! recovery to give callers a higher-level resume/validate API.

use chrono::{Duration, Utc};
use thiserror::Error;

use ctxforge_core::{Session, SessionState};

use crate::store::{SessionQuery, SessionStore, SessionSummary, SqliteSessionStore, StoreError};

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("no sessions found")]
    NoSessionsFound,
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("ambiguous session prefix '{0}': matches {1} sessions")]
    AmbiguousPrefix(String, usize),
    #[error("session is in invalid state for resume: {0:?}")]
    InvalidState(SessionState),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RecoveryError>;

#[derive(Debug, Clone, Default)]
pub struct RecoveryOptions {
    pub validate_messages: bool,
    pub allowed_states: Option<Vec<SessionState>>,
}

impl RecoveryOptions {
    pub fn resumable() -> Self {
        Self { allowed_states: Some(vec![SessionState::Active, SessionState::Suspended]), ..Default::default() }
    }

    pub fn with_validation() -> Self {
        Self { validate_messages: true, ..Default::default() }
    }
}

pub struct SessionRecovery<S: SessionStore> {
    store: S,
}

impl SessionRecovery<SqliteSessionStore> {
    pub fn open_default() -> std::result::Result<Self, StoreError> {
        Ok(Self { store: SqliteSessionStore::open_default()? })
    }
}

impl<S: SessionStore> SessionRecovery<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn is_resumable_state(&self, state: SessionState) -> bool {
        matches!(state, SessionState::Active | SessionState::Suspended)
    }

    pub async fn resume_most_recent(&self) -> Result<Session> {
        let summary = self.store.get_most_recent().await?.ok_or(RecoveryError::NoSessionsFound)?;
        if !self.is_resumable_state(summary.state) {
            return Err(RecoveryError::InvalidState(summary.state));
        }
        Ok(self.store.get(&summary.id).await?)
    }

    pub async fn resume(&self, id: &str) -> Result<Session> {
        let session = self.store.get(id).await.map_err(|_| RecoveryError::SessionNotFound(id.to_string()))?;
        if !self.is_resumable_state(session.metadata.state) {
            return Err(RecoveryError::InvalidState(session.metadata.state));
        }
        Ok(session)
    }

    pub async fn resume_by_prefix(&self, prefix: &str) -> Result<Session> {
        let matches = self.store.find_by_prefix(prefix).await?;
        match matches.len() {
            0 => Err(RecoveryError::SessionNotFound(prefix.to_string())),
            1 => {
                let summary = &matches[0];
                if !self.is_resumable_state(summary.state) {
                    return Err(RecoveryError::InvalidState(summary.state));
                }
                Ok(self.store.get(&summary.id).await?)
            }
            n => Err(RecoveryError::AmbiguousPrefix(prefix.to_string(), n)),
        }
    }

    /// Try an exact id first, then fall back to prefix matching, then the
    /// most recently active session if no id was given at all.
    pub async fn smart_resume(&self, id_or_prefix: Option<&str>) -> Result<Session> {
        match id_or_prefix {
            Some(id) => match self.resume(id).await {
                Ok(session) => Ok(session),
                Err(_) => self.resume_by_prefix(id).await,
            },
            None => self.resume_most_recent().await,
        }
    }

    pub async fn validate(&self, id: &str, options: &RecoveryOptions) -> Result<ValidationResult> {
        let session = self.store.get(id).await.map_err(|_| RecoveryError::SessionNotFound(id.to_string()))?;
        let mut result = ValidationResult { session_id: id.to_string(), is_valid: true, issues: Vec::new() };

        if let Some(allowed) = &options.allowed_states {
            if !allowed.contains(&session.metadata.state) {
                result.issues.push(ValidationIssue {
                    severity: IssueSeverity::Warning,
                    description: format!("session state {:?} not in allowed states", session.metadata.state),
                });
            }
        }

        let stored_count = session.metadata.metrics.turn_count as usize;
        let actual_count = session.messages.len();
        if stored_count != actual_count && stored_count > 0 {
            result.issues.push(ValidationIssue {
                severity: IssueSeverity::Warning,
                description: format!("message count mismatch: metadata says {stored_count}, found {actual_count}"),
            });
        }

        if options.validate_messages {
            for (idx, message) in session.messages.iter().enumerate() {
                if message.id.is_empty() {
                    result.issues.push(ValidationIssue {
                        severity: IssueSeverity::Error,
                        description: format!("message {idx} has an empty id"),
                    });
                    result.is_valid = false;
                }
            }
        }

        Ok(result)
    }

    pub async fn archive_old_sessions(&self, older_than_days: u32) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);
        let sessions = self.store.list(&SessionQuery::new().with_limit(1000)).await?;

        let mut archived = Vec::new();
        for summary in sessions {
            if summary.last_active_at < cutoff && summary.state != SessionState::Archived {
                self.store.set_state(&summary.id, SessionState::Archived).await?;
                archived.push(summary.id);
            }
        }
        Ok(archived)
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        Ok(self.store.list(&SessionQuery::new().with_limit(limit)).await?)
    }

    pub async fn list_by_state(&self, state: SessionState, limit: usize) -> Result<Vec<SessionSummary>> {
        Ok(self.store.list(&SessionQuery::new().with_state(state).with_limit(limit)).await?)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub session_id: String,
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: IssueSeverity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Info,
    Warning,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteSessionStore;
    use ctxforge_core::Session;
    use tempfile::TempDir;

    async fn fixture() -> (SessionRecovery<SqliteSessionStore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SqliteSessionStore::new(dir.path()).unwrap();
        (SessionRecovery::new(store), dir)
    }

    #[tokio::test]
    async fn resume_most_recent_fails_with_no_sessions() {
        let (recovery, _dir) = fixture().await;
        assert!(matches!(recovery.resume_most_recent().await, Err(RecoveryError::NoSessionsFound)));
    }

    #[tokio::test]
    async fn resume_most_recent_returns_the_only_session() {
        let (recovery, _dir) = fixture().await;
        let session = Session::new();
        recovery.store().create(&session).await.unwrap();
        let resumed = recovery.resume_most_recent().await.unwrap();
        assert_eq!(resumed.id(), session.id());
    }

    #[tokio::test]
    async fn resume_by_prefix_finds_unique_match() {
        let (recovery, _dir) = fixture().await;
        let session = Session::new();
        recovery.store().create(&session).await.unwrap();
        let prefix = &session.id()[..8];
        let resumed = recovery.resume_by_prefix(prefix).await.unwrap();
        assert_eq!(resumed.id(), session.id());
    }

    #[tokio::test]
    async fn resume_archived_session_fails() {
        let (recovery, _dir) = fixture().await;
        let session = Session::new();
        recovery.store().create(&session).await.unwrap();
        recovery.store().set_state(session.id(), SessionState::Archived).await.unwrap();
        assert!(matches!(recovery.resume(session.id()).await, Err(RecoveryError::InvalidState(_))));
    }

    #[tokio::test]
    async fn smart_resume_falls_back_to_most_recent_with_no_id() {
        let (recovery, _dir) = fixture().await;
        let session = Session::new();
        recovery.store().create(&session).await.unwrap();
        let resumed = recovery.smart_resume(None).await.unwrap();
        assert_eq!(resumed.id(), session.id());
    }

    #[tokio::test]
    async fn validate_flags_empty_message_ids() {
        let (recovery, _dir) = fixture().await;
        let session = Session::new();
        recovery.store().create(&session).await.unwrap();
        let result = recovery.validate(session.id(), &RecoveryOptions::with_validation()).await.unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn list_recent_respects_limit() {
        let (recovery, _dir) = fixture().await;
        for _ in 0..5 {
            recovery.store().create(&Session::new()).await.unwrap();
        }
        let recent = recovery.list_recent(3).await.unwrap();
        assert_eq!(recent.len(), 3);
    }
}
