//! C5 — Summarizer.
//!
//! Turns a run of messages into prose via the language model, chunking
//! adaptively so no single request overflows the provider's own limits.
//! Pure extraction helpers are synchronous and infallible; the chunk calls
//! that reach out to a `ChatClient` are the only fallible part.

use std::collections::HashSet;
use std::path::PathBuf;

use ctxforge_core::{CompactionConfig, Error, Message, Result, Role};
use ctxforge_providers::{ChatClient, ChatRequest};

use crate::tokens::{estimate_message, estimate_messages};

const READ_TOOL_NAMES: &[&str] = &["read_file", "search_file", "file_search", "grep_search", "semantic_search"];
const WRITE_TOOL_NAMES: &[&str] = &[
    "write_file",
    "edit_file",
    "create_file",
    "replace_string_in_file",
    "multi_replace_string_in_file",
    "delete_file",
    "rename_file",
];
const PATH_ARG_KEYS: &[&str] = &["path", "file", "filePath", "file_path", "filename", "target_file"];
const ERROR_MARKERS: &[&str] = &["error", "failed", "error:", "permission denied", "not found", "timed out"];

/// Facts pulled mechanically out of a message range, folded into the
/// summary prompt alongside whatever the model itself produces.
#[derive(Debug, Clone, Default)]
pub struct ExtractedMetadata {
    pub files_read: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub recent_tool_failures: Vec<String>,
}

pub fn extract_metadata(messages: &[Message]) -> ExtractedMetadata {
    let mut meta = ExtractedMetadata::default();
    let mut seen_read = HashSet::new();
    let mut seen_written = HashSet::new();

    for message in messages {
        if message.role != Role::Assistant {
            continue;
        }
        for tc in &message.tool_calls {
            let Some(path) = extract_path(&tc.arguments) else { continue };
            if WRITE_TOOL_NAMES.iter().any(|n| n.eq_ignore_ascii_case(&tc.name)) {
                if seen_written.insert(path.clone()) {
                    meta.files_modified.push(path);
                }
            } else if READ_TOOL_NAMES.iter().any(|n| n.eq_ignore_ascii_case(&tc.name)) {
                if seen_read.insert(path.clone()) {
                    meta.files_read.push(path);
                }
            }
        }
    }

    let last_tool_messages: Vec<&Message> = messages.iter().filter(|m| m.role == Role::Tool).rev().take(8).collect();
    for message in last_tool_messages.into_iter().rev() {
        let lower = message.content.to_lowercase();
        if ERROR_MARKERS.iter().any(|marker| lower.contains(marker)) {
            let snippet = if message.content.len() > 200 {
                format!("{}...", &message.content[..safe_boundary(&message.content, 197)])
            } else {
                message.content.clone()
            };
            meta.recent_tool_failures.push(snippet);
        }
    }

    meta
}

fn safe_boundary(s: &str, len: usize) -> usize {
    let mut end = len.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}

fn extract_path(arguments: &str) -> Option<PathBuf> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let obj = value.as_object()?;
    for key in PATH_ARG_KEYS {
        if let Some(s) = obj.get(*key).and_then(|v| v.as_str()) {
            return Some(PathBuf::from(s));
        }
    }
    None
}

/// Compute the per-chunk token ceiling. When `config.adaptive_chunk_min_ratio`
/// is set, this is `clamp(total_tokens/4, min_ratio*max_context_tokens,
/// max_ratio*max_context_tokens)`; otherwise it's the flat `chunk_max_tokens`.
fn chunk_limit(messages: &[Message], config: &CompactionConfig) -> u32 {
    if config.adaptive_chunk_min_ratio <= 0.0 {
        return config.chunk_max_tokens.max(1);
    }
    let total_tokens = estimate_messages(messages) as f64;
    let min_bound = config.adaptive_chunk_min_ratio as f64 * config.max_context_tokens as f64;
    let max_bound = config.adaptive_chunk_max_ratio as f64 * config.max_context_tokens as f64;
    (total_tokens / 4.0).max(min_bound).min(max_bound).max(1.0) as u32
}

/// Split `messages` into chunks sized to roughly `chunk_limit`, never
/// splitting a single message across two chunks.
pub fn chunk_messages(messages: &[Message], config: &CompactionConfig) -> Vec<Vec<Message>> {
    if messages.is_empty() {
        return vec![];
    }

    let target = chunk_limit(messages, config);

    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0u32;

    for message in messages {
        let cost = estimate_message(message);
        if !current.is_empty() && current_tokens + cost > target {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += cost;
        current.push(message.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Oversize stubbing: any non-system message whose estimated token count
/// exceeds `max_single_msg_ratio * max_context_tokens` is replaced with a
/// short notice before chunking, so a single giant tool result can't crowd
/// out the rest of the range being summarized.
pub fn stub_oversized_messages(messages: &[Message], config: &CompactionConfig) -> Vec<Message> {
    let ceiling = (config.max_single_msg_ratio * config.max_context_tokens as f32) as u32;
    messages
        .iter()
        .map(|m| {
            if m.role != Role::System && estimate_message(m) > ceiling {
                let mut stub = m.clone();
                stub.content = stub_oversized(m);
                stub.tool_calls.clear();
                stub.token_count = None;
                stub
            } else {
                m.clone()
            }
        })
        .collect()
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool Result",
    }
}

/// Tool content is truncated to 2 KiB inside the summarization prompt so a
/// single large tool result doesn't blow up the summarizer's own request.
const PROMPT_TOOL_CONTENT_CAP: usize = 2_048;

fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for message in messages {
        let cap = if message.role == Role::Tool { PROMPT_TOOL_CONTENT_CAP } else { message.content.len() };
        let content = if message.content.len() > cap {
            format!("{}...", &message.content[..safe_boundary(&message.content, cap)])
        } else {
            message.content.clone()
        };
        out.push_str(&format!("[{}]: {}\n", role_label(message.role), content));
    }
    out
}

/// A chunk prompt for the very first summarization pass over a range (no
/// prior summary to fold in).
fn structured_prompt(chunk: &[Message], metadata: &ExtractedMetadata) -> String {
    let mut prompt = String::from(
        "Summarize the following portion of an agent conversation. Write exactly these \
         five labeled markdown sections, in this order:\n\
         ## Goal\n\
         ## Progress\n\
         ## Key Decisions\n\
         ## Important Context\n\
         ## Open Issues / Next Steps\n\n",
    );

    if !metadata.files_read.is_empty() {
        prompt.push_str(&format!(
            "Files read: {}\n",
            metadata.files_read.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
        ));
    }
    if !metadata.files_modified.is_empty() {
        prompt.push_str(&format!(
            "Files modified: {}\n",
            metadata.files_modified.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
        ));
    }
    if !metadata.recent_tool_failures.is_empty() {
        prompt.push_str("Recent tool failures:\n");
        for failure in &metadata.recent_tool_failures {
            prompt.push_str(&format!("- {}\n", failure));
        }
    }

    prompt.push_str("\n## Conversation\n");
    prompt.push_str(&render_transcript(chunk));
    prompt
}

/// A chunk prompt for an incremental pass that must merge with a previous
/// summary rather than produce a standalone one.
fn incremental_prompt(chunk: &[Message], previous_summary: &str, metadata: &ExtractedMetadata) -> String {
    let mut prompt = format!(
        "Update the running summary below with the new conversation turns that follow. \
         Keep the same five labeled sections (Goal, Progress, Key Decisions, Important Context, \
         Open Issues) and fold the new information in rather than appending a second copy.\n\n\
         ## Previous Summary\n{}\n",
        previous_summary
    );

    if !metadata.files_modified.is_empty() {
        prompt.push_str(&format!(
            "\nNewly modified files: {}\n",
            metadata.files_modified.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ")
        ));
    }

    prompt.push_str("\n## New Turns\n");
    prompt.push_str(&render_transcript(chunk));
    prompt
}

/// Summarize `messages` into prose, chunking adaptively and making one
/// `ChatClient::chat` call per chunk. Only the first chunk ever sees
/// `previous_summary` (via the incremental template, when one exists);
/// every other chunk is summarized independently via the structured
/// template and the per-chunk results are joined with a separator —
/// metadata (files read/modified, tool failures) is likewise computed once
/// over the whole range and attached only to the first chunk's prompt, to
/// avoid repeating it in every chunk.
pub async fn summarize(
    client: &dyn ChatClient,
    model: &str,
    messages: &[Message],
    previous_summary: Option<&str>,
    config: &CompactionConfig,
) -> Result<String> {
    if messages.is_empty() {
        return Ok(previous_summary.unwrap_or_default().to_string());
    }

    let stubbed = stub_oversized_messages(messages, config);
    let metadata = extract_metadata(&stubbed);
    let chunks = chunk_messages(&stubbed, config);
    let mut parts = Vec::with_capacity(chunks.len());

    for (i, chunk) in chunks.iter().enumerate() {
        let prompt = if i == 0 {
            match previous_summary {
                Some(prev) => incremental_prompt(chunk, prev, &metadata),
                None => structured_prompt(chunk, &metadata),
            }
        } else {
            structured_prompt(chunk, &ExtractedMetadata::default())
        };

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![],
            max_tokens: config.summary_max_tokens,
            temperature: Some(0.3),
        };

        let response = client
            .chat(request)
            .await
            .map_err(|e| Error::Internal(format!("summarization chunk failed: {e}")))?;

        parts.push(response.content);
    }

    Ok(parts.join("\n\n---\n\n"))
}

/// Produce a placeholder summary without calling the model, used when a
/// single message is itself too large to summarize sensibly (e.g. a
/// multi-megabyte tool result) — stubs it out with a note of its size.
pub fn stub_oversized(message: &Message) -> String {
    format!(
        "[{} message omitted: {} bytes exceeded the summarizable size]",
        role_label(message.role),
        message.content.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::ToolCall;

    #[test]
    fn extracts_modified_and_read_files_by_tool_name() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "read_file", r#"{"path":"a.rs"}"#)]),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c2", "write_file", r#"{"file_path":"b.rs"}"#)]),
        ];
        let meta = extract_metadata(&msgs);
        assert_eq!(meta.files_read, vec![PathBuf::from("a.rs")]);
        assert_eq!(meta.files_modified, vec![PathBuf::from("b.rs")]);
    }

    #[test]
    fn scans_only_last_eight_tool_messages_for_failures() {
        let mut msgs = vec![Message::tool_result("c0", "Error: old failure")];
        for i in 0..8 {
            msgs.push(Message::tool_result(format!("c{}", i + 1), "ok"));
        }
        let meta = extract_metadata(&msgs);
        assert!(meta.recent_tool_failures.is_empty());
    }

    #[test]
    fn detects_error_markers_without_the_word_error_or_failed() {
        let msgs = vec![
            Message::tool_result("c0", "permission denied: /etc/shadow"),
            Message::tool_result("c1", "no such file, not found"),
            Message::tool_result("c2", "request timed out"),
        ];
        let meta = extract_metadata(&msgs);
        assert_eq!(meta.recent_tool_failures.len(), 3);
    }

    #[test]
    fn recognizes_additional_spec_tool_names() {
        let msgs = vec![
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "grep_search", r#"{"target_file":"a.rs"}"#)]),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c2", "delete_file", r#"{"filePath":"b.rs"}"#)]),
        ];
        let meta = extract_metadata(&msgs);
        assert_eq!(meta.files_read, vec![PathBuf::from("a.rs")]);
        assert_eq!(meta.files_modified, vec![PathBuf::from("b.rs")]);
    }

    #[test]
    fn chunking_never_splits_below_one_message() {
        let msgs = vec![Message::user("a".repeat(50_000))];
        let config = CompactionConfig { adaptive_chunk_min_ratio: 0.0, chunk_max_tokens: 100, ..CompactionConfig::default() };
        let chunks = chunk_messages(&msgs, &config);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
    }

    #[test]
    fn chunking_groups_small_messages_together() {
        let msgs: Vec<Message> = (0..20).map(|i| Message::user(format!("msg {}", i))).collect();
        let config = CompactionConfig { adaptive_chunk_min_ratio: 0.0, chunk_max_tokens: 10_000, ..CompactionConfig::default() };
        let chunks = chunk_messages(&msgs, &config);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn adaptive_chunk_limit_respects_configured_ratio_bounds() {
        let msgs: Vec<Message> = (0..5).map(|i| Message::user(format!("m{}", i))).collect();
        let config = CompactionConfig {
            max_context_tokens: 1_000,
            adaptive_chunk_min_ratio: 0.15,
            adaptive_chunk_max_ratio: 0.40,
            ..CompactionConfig::default()
        };
        // total/4 for these tiny messages is far below 0.15*1000=150, so the
        // lower ratio bound should win.
        assert_eq!(chunk_limit(&msgs, &config), 150);
    }

    #[test]
    fn oversized_message_is_stubbed_before_chunking() {
        let msgs = vec![Message::user("x".repeat(10_000))];
        let config = CompactionConfig { max_context_tokens: 1_000, max_single_msg_ratio: 0.1, ..CompactionConfig::default() };
        let stubbed = stub_oversized_messages(&msgs, &config);
        assert!(stubbed[0].content.contains("omitted"));
    }

    #[test]
    fn system_messages_are_never_stubbed() {
        let msgs = vec![Message::system("x".repeat(10_000))];
        let config = CompactionConfig { max_context_tokens: 1_000, max_single_msg_ratio: 0.1, ..CompactionConfig::default() };
        let stubbed = stub_oversized_messages(&msgs, &config);
        assert_eq!(stubbed[0].content.len(), 10_000);
    }

    #[test]
    fn stub_reports_size_without_calling_model() {
        let m = Message::tool_result("c1", "x".repeat(10));
        let stub = stub_oversized(&m);
        assert!(stub.contains("10 bytes"));
    }
}
