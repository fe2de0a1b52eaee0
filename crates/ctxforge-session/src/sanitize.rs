//! C2 — Message Sanitizer.
//!
//! Repairs tool-call/tool-result structural invariants on an arbitrary
//! message list. Pure: never mutates its input, never fails.

use std::collections::HashSet;

use ctxforge_core::{Message, Role};

/// Run the full three-phase sanitization pass.
pub fn sanitize(messages: &[Message]) -> Vec<Message> {
    let phase_a = phase_a_validate_arguments(messages);
    let valid_ids = collect_tool_call_ids(&phase_a);
    let phase_b = phase_b_deorphan(phase_a, &valid_ids);
    phase_c_enforce_ordering(phase_b)
}

fn collect_tool_call_ids(messages: &[Message]) -> HashSet<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().map(|tc| tc.id.clone()))
        .collect()
}

/// Phase A: drop tool_calls with malformed (non-empty, unparseable) JSON
/// arguments; drop assistant messages left with no content and no tool_calls.
fn phase_a_validate_arguments(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());

    for message in messages {
        if message.role != Role::Assistant {
            out.push(message.clone());
            continue;
        }

        let mut m = message.clone();
        let before = m.tool_calls.len();
        m.tool_calls.retain(|tc| tc.has_well_formed_arguments());
        if before > 0 && m.tool_calls.is_empty() && m.content.trim().is_empty() {
            tracing::debug!(message_id = %m.id, "dropping assistant message: all tool_calls had malformed arguments and content is empty");
            continue;
        }
        out.push(m);
    }

    out
}

/// Phase B: drop tool messages whose `tool_call_id` has no surviving owner.
fn phase_b_deorphan(messages: Vec<Message>, valid_ids: &HashSet<String>) -> Vec<Message> {
    messages
        .into_iter()
        .filter(|m| {
            if m.role != Role::Tool {
                return true;
            }
            match &m.tool_call_id {
                Some(id) if valid_ids.contains(id) => true,
                _ => {
                    tracing::debug!(message_id = %m.id, "dropping orphan tool message");
                    false
                }
            }
        })
        .collect()
}

/// Phase C: enforce that every assistant tool_calls group is immediately and
/// completely followed by its own tool messages, with nothing interleaved.
fn phase_c_enforce_ordering(messages: Vec<Message>) -> Vec<Message> {
    let n = messages.len();
    let mut invalid_ids: HashSet<String> = HashSet::new();

    let mut i = 0;
    while i < n {
        if messages[i].role == Role::Assistant && !messages[i].tool_calls.is_empty() {
            let expected: HashSet<String> = messages[i].tool_calls.iter().map(|tc| tc.id.clone()).collect();
            let mut found: HashSet<String> = HashSet::new();
            let mut j = i + 1;
            while j < n && messages[j].role == Role::Tool {
                if let Some(id) = &messages[j].tool_call_id {
                    found.insert(id.clone());
                }
                j += 1;
            }
            if found != expected {
                tracing::debug!(
                    message_id = %messages[i].id,
                    expected = expected.len(),
                    found = found.len(),
                    "incomplete tool_call group, stripping"
                );
                invalid_ids.extend(expected);
            }
        }
        i += 1;
    }

    let mut out = Vec::with_capacity(n);
    for message in messages {
        match message.role {
            Role::Tool => {
                let keep = message
                    .tool_call_id
                    .as_ref()
                    .map(|id| !invalid_ids.contains(id))
                    .unwrap_or(false);
                if keep {
                    out.push(message);
                } else {
                    tracing::debug!(message_id = %message.id, "dropping tool message from incomplete group");
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                let all_invalid = message.tool_calls.iter().all(|tc| invalid_ids.contains(&tc.id));
                if all_invalid {
                    let mut stripped = message.clone();
                    stripped.tool_calls.clear();
                    if stripped.content.trim().is_empty() {
                        tracing::debug!(message_id = %stripped.id, "dropping empty assistant message after stripping invalid tool_calls");
                    } else {
                        out.push(stripped);
                    }
                } else {
                    out.push(message);
                }
            }
            _ => out.push(message),
        }
    }

    log_residual_ordering_breaks(&out);
    out
}

/// Post-validation check: log any ordering break that survived repair.
fn log_residual_ordering_breaks(messages: &[Message]) {
    let mut owned: HashSet<String> = HashSet::new();
    for (idx, message) in messages.iter().enumerate() {
        match message.role {
            Role::Assistant => {
                for tc in &message.tool_calls {
                    owned.insert(tc.id.clone());
                }
            }
            Role::Tool => {
                let ok = message
                    .tool_call_id
                    .as_ref()
                    .map(|id| owned.contains(id))
                    .unwrap_or(false);
                if !ok {
                    tracing::error!(index = idx, message_id = %message.id, "residual tool-call ordering break after sanitize");
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxforge_core::ToolCall;

    #[test]
    fn idempotent() {
        let msgs = vec![
            Message::user("do"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("call_1", "search", r#"{"q":1}"#)]),
            Message::tool_result("call_1", "r1"),
            Message::assistant("done"),
        ];
        let once = sanitize(&msgs);
        let twice = sanitize(&once);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.id, b.id);
        }
    }

    #[test]
    fn drops_malformed_tool_call_arguments() {
        let msgs = vec![Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "search", "{not json")],
        )];
        let out = sanitize(&msgs);
        assert!(out.is_empty());
    }

    #[test]
    fn drops_orphan_tool_message() {
        let msgs = vec![Message::user("hi"), Message::tool_result("call_x", "orphan")];
        let out = sanitize(&msgs);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
    }

    #[test]
    fn repairs_interleaved_group_with_message_between_call_and_result() {
        // A user message interleaved between the tool_call and its result
        // breaks the contiguous group.
        let msgs = vec![
            Message::user("do"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("call_1", "x", "{}")]),
            Message::user("oops"),
            Message::tool_result("call_1", "r1"),
            Message::assistant("done"),
        ];
        let out = sanitize(&msgs);
        assert!(out.iter().all(|m| m.role != Role::Tool));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].content, "do");
        assert_eq!(out[1].content, "oops");
        assert_eq!(out[2].content, "done");
    }

    #[test]
    fn complete_group_is_preserved() {
        let msgs = vec![
            Message::user("do"),
            Message::assistant_with_tool_calls("", vec![ToolCall::new("call_1", "x", "{}")]),
            Message::tool_result("call_1", "r1"),
            Message::assistant("done"),
        ];
        let out = sanitize(&msgs);
        assert_eq!(out.len(), 4);
        assert!(out.iter().any(|m| m.role == Role::Tool));
    }
}
