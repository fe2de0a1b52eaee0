//! C6 — Cut-Point Selector.
//!
//! Chooses the index in a conversation slice above which messages are kept
//! verbatim and below which messages are eligible for summarization or
//! dropping. Pure, deterministic, never fails.

use ctxforge_core::{Message, Role};

use crate::tokens::estimate_message;

#[derive(Debug, Clone, Copy)]
pub struct CutPoint {
    /// Index of the first message to keep verbatim (everything before it is
    /// the compaction candidate range).
    pub keep_from: usize,
}

/// Walk backward from the end of `messages` accumulating estimated tokens
/// until `reserve_tokens` is exhausted, then reconcile against
/// `keep_recent_count`, which acts as both a floor and a ceiling on the kept
/// count (per `CompactionConfig::keep_recent_count`'s own description): if
/// the reserve walk wants to keep fewer than `keep_recent_count`, the floor
/// pulls it back up to that minimum; if the reserve walk is so generous it
/// would keep the entire conversation (no candidate to compact at all), the
/// ceiling forces a cut down to exactly `keep_recent_count` so that a
/// compaction invoked for this reason still makes progress.
pub fn find_cut(messages: &[Message], reserve_tokens: u32, keep_recent_count: usize) -> CutPoint {
    let n = messages.len();
    if n == 0 {
        return CutPoint { keep_from: 0 };
    }

    let mut used = 0u32;
    let mut keep_from = n;
    for i in (0..n).rev() {
        let cost = estimate_message(&messages[i]);
        if used + cost > reserve_tokens && keep_from < n {
            break;
        }
        used += cost;
        keep_from = i;
    }

    let floor_by_count = n.saturating_sub(keep_recent_count);
    let keep_from = if keep_from == 0 {
        floor_by_count
    } else {
        keep_from.min(floor_by_count)
    };

    CutPoint {
        keep_from: adjust_keep_boundary(messages, keep_from),
    }
}

/// Shift a proposed keep-boundary backward (never forward) past any leading
/// tool-result messages, so the kept range never opens mid tool_call/result
/// pair — a tool message can only ever appear after the assistant message
/// that produced its `tool_call_id`.
pub fn adjust_keep_boundary(messages: &[Message], keep_from: usize) -> usize {
    let mut idx = keep_from;
    while idx > 0 && idx < messages.len() && messages[idx].role == Role::Tool {
        idx -= 1;
    }
    idx
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::ToolCall;

    #[test]
    fn empty_input_cuts_at_zero() {
        let cut = find_cut(&[], 1000, 4);
        assert_eq!(cut.keep_from, 0);
    }

    #[test]
    fn generous_reserve_still_forces_progress_via_the_ceiling() {
        // A reserve this large never exhausts, so the token walk alone would
        // keep everything (keep_from=0). The ceiling then forces a cut down
        // to exactly `len - keep_recent_count` so compaction makes progress.
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("m{}", i))).collect();
        let cut = find_cut(&msgs, 100_000, 3);
        assert_eq!(cut.keep_from, 7);
    }

    #[test]
    fn tight_reserve_is_capped_by_the_keep_recent_count_floor() {
        // keep_recent_count=2 demands keep_from <= len-2 = 8; a near-zero
        // reserve would otherwise want keep_from close to len, so the floor
        // must pull it back down.
        let msgs: Vec<Message> = (0..10).map(|i| Message::user(format!("m{}", i))).collect();
        let cut = find_cut(&msgs, 1, 2);
        assert!(cut.keep_from <= 8);
    }

    #[test]
    fn adjust_keep_boundary_walks_back_past_leading_tool_messages() {
        let msgs = vec![
            Message::user("do"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("c1", "x", "{}")]),
            Message::tool_result("c1", "r1"),
            Message::assistant("done"),
        ];
        // A naive cut landing on index 2 (the tool result) must be walked
        // back to include its owning assistant message at index 1.
        assert_eq!(adjust_keep_boundary(&msgs, 2), 1);
    }

    #[test]
    fn adjust_keep_boundary_is_noop_when_already_clean() {
        let msgs = vec![Message::user("a"), Message::user("b")];
        assert_eq!(adjust_keep_boundary(&msgs, 1), 1);
    }
}
