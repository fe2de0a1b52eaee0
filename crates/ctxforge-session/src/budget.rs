//! C3 — Byte Budgeter.
//!
//! Shrinks a message list until its estimated serialized size fits a byte
//! budget, via four progressive, purely string-manipulating phases. Never
//! calls the language model; never fails — the worst case is an
//! aggressively truncated single round.

use ctxforge_core::Message;

use crate::cutpoint::adjust_keep_boundary;

/// Messages within this many of the end are untouchable in Phases 1–3.
pub const DEFAULT_PROTECTED_TAIL: usize = 4;

const TRUNCATION_SUFFIX: &str = "[... truncated ...]";
const MIDDLE_TRUNCATION_MARKER: &str = "[… middle truncated …]";
const DROPPED_NOTICE: &str = "[Earlier context dropped to stay within the request size budget.]";

fn contribution(message: &Message) -> usize {
    let mut total = message.content.len() + 80;
    for tc in &message.tool_calls {
        total += tc.arguments.len() + 100;
        if let Some(f) = &tc.function {
            total += f.name.len() + f.arguments.len() + 50;
        }
    }
    total
}

fn estimated_bytes(messages: &[Message], tools_overhead_bytes: usize) -> usize {
    let baseline = if tools_overhead_bytes > 0 {
        tools_overhead_bytes + 2_000
    } else {
        20_000
    };
    baseline + messages.iter().map(contribution).sum::<usize>()
}

#[derive(Debug, Clone)]
pub struct BudgetedRequest {
    pub messages: Vec<Message>,
    pub estimated_bytes: usize,
}

/// Run the byte budgeter. `tools_overhead_bytes` is the caller's best
/// estimate of the serialized tool-definitions payload (pass 0 if unknown —
/// the engine then falls back to a conservative 20 KiB baseline).
pub fn budget(
    messages: &[Message],
    tools_overhead_bytes: usize,
    max_request_bytes: usize,
    protected_tail: usize,
) -> BudgetedRequest {
    let mut current = messages.to_vec();
    let fits = |m: &[Message]| estimated_bytes(m, tools_overhead_bytes) <= max_request_bytes;

    if fits(&current) {
        return BudgetedRequest {
            estimated_bytes: estimated_bytes(&current, tools_overhead_bytes),
            messages: current,
        };
    }

    phase1_truncate_historical_tool_results(&mut current, protected_tail);
    if fits(&current) {
        return finish(current, tools_overhead_bytes);
    }

    phase2_truncate_historical_prose(&mut current, protected_tail);
    if fits(&current) {
        return finish(current, tools_overhead_bytes);
    }

    current = phase3_drop_oldest(&current, tools_overhead_bytes, max_request_bytes, protected_tail);
    if fits(&current) {
        return finish(current, tools_overhead_bytes);
    }

    current = phase4_truncate_protected_tail(current, max_request_bytes);
    finish(current, tools_overhead_bytes)
}

fn finish(messages: Vec<Message>, tools_overhead_bytes: usize) -> BudgetedRequest {
    let estimated = estimated_bytes(&messages, tools_overhead_bytes);
    BudgetedRequest {
        messages,
        estimated_bytes: estimated,
    }
}

fn historical_range(len: usize, protected_tail: usize) -> std::ops::Range<usize> {
    0..len.saturating_sub(protected_tail)
}

fn head_tail_truncate(content: &str, tier: usize, marker: &str) -> String {
    if content.len() <= tier {
        return content.to_string();
    }
    let head_len = (tier * 2 / 3).min(content.len());
    let tail_len = (tier / 3).min(content.len().saturating_sub(head_len));
    let head = safe_prefix(content, head_len);
    let tail = safe_suffix(content, tail_len);
    format!("{}{}{}", head, marker, tail)
}

/// Take a byte prefix on a UTF-8 char boundary no later than `len`.
pub(crate) fn safe_prefix(s: &str, len: usize) -> &str {
    let mut end = len.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Take a byte suffix on a UTF-8 char boundary no earlier than `len` from the end.
pub(crate) fn safe_suffix(s: &str, len: usize) -> &str {
    let mut start = s.len().saturating_sub(len);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

fn phase1_truncate_historical_tool_results(messages: &mut [Message], protected_tail: usize) {
    let range = historical_range(messages.len(), protected_tail);
    for tier in [4096usize, 1024, 256] {
        for idx in range.clone() {
            let m = &mut messages[idx];
            if m.role != ctxforge_core::Role::Tool {
                continue;
            }
            if m.content.len() > tier {
                let prefix = safe_prefix(&m.content, tier);
                m.content = format!("{}{}", prefix, TRUNCATION_SUFFIX);
            }
        }
    }
}

fn phase2_truncate_historical_prose(messages: &mut [Message], protected_tail: usize) {
    let range = historical_range(messages.len(), protected_tail);
    for tier in [2048usize, 512] {
        for idx in range.clone() {
            let m = &mut messages[idx];
            if m.role == ctxforge_core::Role::System || m.role == ctxforge_core::Role::Tool {
                continue;
            }
            if m.content.len() > tier {
                m.content = head_tail_truncate(&m.content, tier, MIDDLE_TRUNCATION_MARKER);
            }
        }
    }
}

fn notice_role_for(next: ctxforge_core::Role) -> ctxforge_core::Role {
    use ctxforge_core::Role;
    if next == Role::Assistant {
        Role::User
    } else {
        Role::Assistant
    }
}

fn make_notice(role: ctxforge_core::Role, text: &str) -> Message {
    use ctxforge_core::Role;
    match role {
        Role::Assistant => Message::assistant(text),
        _ => Message::user(text),
    }
}

fn phase3_drop_oldest(
    messages: &[Message],
    tools_overhead_bytes: usize,
    max_request_bytes: usize,
    protected_tail: usize,
) -> Vec<Message> {
    use ctxforge_core::Role;

    let (system, conversation): (Vec<Message>, Vec<Message>) =
        messages.iter().cloned().partition(|m| m.role == Role::System);

    let baseline = if tools_overhead_bytes > 0 {
        tools_overhead_bytes + 2_000
    } else {
        20_000
    };
    let system_bytes: usize = system.iter().map(contribution).sum();
    let available = max_request_bytes
        .saturating_sub(baseline + system_bytes)
        .max(8 * 1024);

    let n = conversation.len();
    let protected = protected_tail.min(n);
    let mut kept_from = n;
    let mut running = 0usize;

    for i in (0..n).rev() {
        let c = contribution(&conversation[i]);
        if n - i <= protected {
            kept_from = i;
            running += c;
            continue;
        }
        if running + c > available {
            break;
        }
        running += c;
        kept_from = i;
    }

    let kept_from = adjust_keep_boundary(&conversation, kept_from);

    if kept_from >= n {
        return force_keep_last_round(&system, &conversation, 256);
    }

    let mut kept = conversation[kept_from..].to_vec();
    let mut out = system;
    if kept_from > 0 {
        let first_role = kept.first().map(|m| m.role).unwrap_or(Role::User);
        out.push(make_notice(notice_role_for(first_role), DROPPED_NOTICE));
    }
    out.append(&mut kept);
    out
}

/// Force-keep the last complete round (back to the last user message),
/// truncating each message aggressively so at least something survives.
fn force_keep_last_round(system: &[Message], conversation: &[Message], per_message_cap: usize) -> Vec<Message> {
    use ctxforge_core::Role;

    let last_user = conversation.iter().rposition(|m| m.role == Role::User).unwrap_or(0);
    let mut round: Vec<Message> = conversation[last_user..].to_vec();
    for m in round.iter_mut() {
        if m.content.len() > per_message_cap {
            m.content = head_tail_truncate(&m.content, per_message_cap, MIDDLE_TRUNCATION_MARKER);
        }
    }

    let mut out = system.to_vec();
    out.append(&mut round);
    out
}

fn phase4_truncate_protected_tail(mut messages: Vec<Message>, max_request_bytes: usize) -> Vec<Message> {
    use ctxforge_core::Role;

    for tier in [
        (max_request_bytes / 4).max(1),
        (max_request_bytes / 8).max(1),
        4096,
        1024,
    ] {
        for m in messages.iter_mut() {
            if m.role != Role::Tool {
                continue;
            }
            if m.content.len() > tier {
                tracing::warn!(message_id = %m.id, tier, "truncating protected-tail tool result as last resort");
                m.content = head_tail_truncate(&m.content, tier, MIDDLE_TRUNCATION_MARKER);
            }
        }
    }
    messages
}
