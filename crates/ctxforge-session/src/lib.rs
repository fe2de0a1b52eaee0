//! # ctxforge-session
//!
//! The conversation context manager and compaction engine.
//!
//! Pipeline, in dependency order:
//! - [`tokens`] — heuristic token estimation
//! - [`sanitize`] — tool-call/tool-result structural repair
//! - [`budget`] — byte-budget-aware progressive shrinking
//! - [`truncate`] — token-budget-aware mechanical fallback
//! - [`summarize`] — LLM-driven chunked summarization
//! - [`cutpoint`] — where to cut the history for compaction
//! - [`policy`] — orchestrates sanitizing, cutting, and summarizing with
//!   graceful degradation
//! - [`store`] — the versioned compacted-context log plus session index
//! - [`manager`] — the public `build_context` facade
//!
//! [`recovery`] supplements the pipeline with session resume/validation
//! across process restarts, in the style of the session store this crate
//! builds on.

pub mod budget;
pub mod cutpoint;
pub mod manager;
pub mod policy;
pub mod recovery;
pub mod sanitize;
pub mod store;
pub mod summarize;
pub mod tokens;
pub mod truncate;

pub use budget::{budget, BudgetedRequest, DEFAULT_PROTECTED_TAIL};
pub use cutpoint::{adjust_keep_boundary, find_cut, CutPoint};
pub use manager::{BuiltContext, ContextManager};
pub use policy::{compact, compact_for_session, compact_with_fallback, needs_compaction, needs_memory_flush, truncate_only, CompactionCounters, CompactionError, CompactionOutcome};
pub use recovery::{IssueSeverity, RecoveryError, RecoveryOptions, SessionRecovery, ValidationIssue, ValidationResult};
pub use sanitize::sanitize;
pub use store::{AggregatedStats, ContextStore, SessionQuery, SessionStore, SessionSummary, SqliteSessionStore, StoreError};
pub use summarize::{chunk_messages, extract_metadata, stub_oversized, summarize, ExtractedMetadata};
pub use tokens::{estimate_message, estimate_messages, estimate_text};
pub use truncate::{truncate, TruncationResult};
