//! C1 — Token Estimator.
//!
//! Pure, stateless, heuristic. No network, no allocation beyond the result.

use ctxforge_core::Message;

/// Estimate the token count of a single string: `ceil((len+2)/3)`, 0 for
/// empty input. This is a cheap approximation of a byte-pair-encoding
/// tokenizer — roughly 3 bytes per token for English prose.
pub fn estimate_text(s: &str) -> u32 {
    if s.is_empty() {
        return 0;
    }
    ((s.len() + 2) / 3) as u32
}

/// Sum estimated tokens across a message list, including role/envelope
/// overhead and tool-call payloads.
pub fn estimate_messages(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message).sum()
}

pub fn estimate_message(message: &Message) -> u32 {
    let mut total = estimate_text(&message.content) + 4;

    for tool_call in &message.tool_calls {
        total += estimate_text(&tool_call.arguments);
        if let Some(function) = &tool_call.function {
            total += estimate_text(&function.name) + estimate_text(&function.arguments);
        }
    }

    total
}
