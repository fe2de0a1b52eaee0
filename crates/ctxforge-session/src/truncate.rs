//! C4 — Truncator.
//!
//! Token-budget-aware mechanical fallback used when summarization is
//! unavailable or fails. Accumulates messages newest-to-oldest until
//! the token reserve is exhausted, then truncates the single message that
//! straddles the boundary instead of dropping it outright.

use ctxforge_core::Message;

use crate::budget::{safe_prefix, safe_suffix};
use crate::cutpoint::adjust_keep_boundary;
use crate::tokens::estimate_message;

const MIN_HEAD_CHARS: usize = 200;
const MIN_PER_MESSAGE_TOKENS: u32 = 50;
const TRUNCATION_MARKER: &str = "[... truncated ...]";

#[derive(Debug, Clone)]
pub struct TruncationResult {
    pub kept: Vec<Message>,
    pub used_tokens: u32,
}

/// Accumulate `messages` from the end backward, fitting as many whole
/// messages as possible within `available_tokens`. If the next candidate
/// message doesn't fit whole, it is proportionally truncated to
/// `available_tokens / 2` rather than dropped, as long as at least
/// `MIN_HEAD_CHARS` of its content survive; otherwise it is dropped and
/// accumulation stops.
pub fn truncate(messages: &[Message], available_tokens: u32) -> TruncationResult {
    let n = messages.len();
    if n == 0 {
        return TruncationResult { kept: vec![], used_tokens: 0 };
    }
    if available_tokens == 0 {
        return force_keep_last_round(messages, available_tokens);
    }

    // `straddler` holds a proportionally-shrunk replacement for the message
    // at the boundary, when one fits; it becomes the first kept message.
    let mut kept_from = n;
    let mut used = 0u32;
    let mut straddler: Option<Message> = None;

    for i in (0..n).rev() {
        let cost = estimate_message(&messages[i]);
        if used + cost <= available_tokens {
            used += cost;
            kept_from = i;
            continue;
        }

        let remaining = available_tokens.saturating_sub(used);
        if remaining > 0 {
            if let Some(shrunk) = shrink_message(&messages[i], remaining / 2) {
                used += estimate_message(&shrunk);
                kept_from = i;
                straddler = Some(shrunk);
            }
        }
        break;
    }

    if kept_from >= n {
        return force_keep_last_round(messages, available_tokens);
    }

    // Check the boundary at `kept_from` itself, whether it holds the
    // straddler's original position or the first message that fit whole.
    let adjusted_from = adjust_keep_boundary(messages, kept_from);

    let mut kept = Vec::with_capacity(n - adjusted_from);
    if adjusted_from < kept_from {
        // Walked back past the boundary message because it was a tool
        // result, to keep its whole owning group intact. The boundary
        // message itself may still have been shrunk into `straddler` (it was
        // oversized); substitute that shrunk version rather than re-inserting
        // the original at full size, or an oversized tool result would ride
        // along unbounded every time its group gets walked back onto.
        kept.extend(messages[adjusted_from..kept_from].iter().cloned());
        match straddler {
            Some(shrunk) => kept.push(shrunk),
            None => kept.push(messages[kept_from].clone()),
        }
        kept.extend(messages[kept_from + 1..].iter().cloned());
    } else if let Some(shrunk) = straddler {
        kept.push(shrunk);
        kept.extend(messages[kept_from + 1..].iter().cloned());
    } else {
        kept.extend(messages[kept_from..].iter().cloned());
    }

    if kept.is_empty() {
        return force_keep_last_round(messages, available_tokens);
    }
    TruncationResult { kept, used_tokens: used }
}

/// Truncate a single message's content to roughly `token_budget` tokens
/// (≈3 bytes/token), proportionally in place: a head (at least
/// `MIN_HEAD_CHARS`) plus a trailing tail, mirroring the Byte Budgeter's
/// head+tail approach so a trailing question or instruction survives.
/// Returns `None` if even the minimum head would not fit, signaling the
/// caller should drop the message instead.
fn shrink_message(message: &Message, token_budget: u32) -> Option<Message> {
    let byte_budget = (token_budget as usize) * 3;
    if byte_budget < MIN_HEAD_CHARS {
        return None;
    }
    if message.content.len() <= byte_budget {
        return Some(message.clone());
    }

    let head_len = (byte_budget * 2 / 3).max(MIN_HEAD_CHARS).min(message.content.len());
    let tail_len = byte_budget.saturating_sub(head_len).min(message.content.len().saturating_sub(head_len));
    let head = safe_prefix(&message.content, head_len);
    let tail = safe_suffix(&message.content, tail_len);

    let mut m = message.clone();
    m.content = format!("{head}{TRUNCATION_MARKER}{tail}");
    m.token_count = None;
    Some(m)
}

/// Force-keep the last complete round (back to the most recent user
/// message), capping each message to `available_tokens / len(round)`
/// (floor `MIN_PER_MESSAGE_TOKENS`) so the conversation never reduces to
/// nothing even when the reserve is smaller than a single message.
fn force_keep_last_round(messages: &[Message], available_tokens: u32) -> TruncationResult {
    use ctxforge_core::Role;

    let last_user = messages.iter().rposition(|m| m.role == Role::User).unwrap_or(messages.len().saturating_sub(1));
    let round = &messages[last_user..];
    if round.is_empty() {
        return TruncationResult { kept: vec![], used_tokens: 0 };
    }

    let per_message = (available_tokens / round.len() as u32).max(MIN_PER_MESSAGE_TOKENS);
    let mut used = 0u32;
    let kept: Vec<Message> = round
        .iter()
        .map(|m| match shrink_message(m, per_message) {
            Some(shrunk) => shrunk,
            None => m.clone(),
        })
        .collect();
    for m in &kept {
        used += estimate_message(m);
    }

    TruncationResult { kept, used_tokens: used }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::estimate_messages;
    use ctxforge_core::{Message, Role, ToolCall};

    #[test]
    fn keeps_everything_when_budget_is_generous() {
        let msgs = vec![Message::user("a"), Message::assistant("b")];
        let result = truncate(&msgs, 10_000);
        assert_eq!(result.kept.len(), 2);
    }

    #[test]
    fn truncates_straddling_message_instead_of_dropping_it() {
        let msgs = vec![
            Message::user("x".repeat(5_000)),
            Message::assistant("recent reply"),
        ];
        let result = truncate(&msgs, 50);
        assert!(!result.kept.is_empty());
    }

    #[test]
    fn single_oversized_message_is_proportionally_shrunk() {
        let msgs = vec![Message::user("a".repeat(10_000))];
        let result = truncate(&msgs, 100);
        assert_eq!(result.kept.len(), 1);
        assert!(result.kept[0].content.len() < 10_000);
    }

    #[test]
    fn force_keep_last_round_never_returns_empty_for_nonempty_input() {
        let msgs = vec![Message::user("hello there"), Message::assistant("hi")];
        let result = truncate(&msgs, 0);
        assert!(!result.kept.is_empty());
    }

    #[test]
    fn shrink_message_preserves_trailing_content() {
        let mut content = "x".repeat(5_000);
        content.push_str("...what is your API key?");
        let msgs = vec![Message::user(content), Message::assistant("recent reply")];
        let result = truncate(&msgs, 500);
        let straddler = &result.kept[0];
        assert!(straddler.content.contains("what is your API key?"));
        assert!(straddler.content.starts_with('x'));
    }

    #[test]
    fn oversized_tool_result_at_boundary_is_truncated_not_dropped_after_walkback() {
        // The tool result is the one message that doesn't fit, so it becomes
        // the straddler; adjust_keep_boundary then walks back onto the
        // owning assistant message, which used to discard the shrunk
        // straddler and re-insert the full 5,000-byte original.
        let msgs = vec![
            Message::user("fetch this"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "fetch", "{}")]),
            Message::tool_result("c1", "word ".repeat(1_000)),
        ];
        let max_context_tokens = 200;
        let result = truncate(&msgs, max_context_tokens);

        assert!(result
            .kept
            .iter()
            .any(|m| m.role == Role::User || m.role == Role::Assistant));
        let tool_msg = result.kept.iter().find(|m| m.role == Role::Tool).expect("tool result kept, not dropped");
        assert!(tool_msg.content.len() < "word ".repeat(1_000).len());
        assert!(estimate_messages(&result.kept) <= 2 * max_context_tokens);
    }
}
