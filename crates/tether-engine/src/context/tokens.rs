use tether_core::messages::Message;

/// Per-message framing overhead.
const MESSAGE_OVERHEAD: usize = 4;

/// Heuristic: fenced blocks, or a high density of code punctuation.
pub fn looks_like_code(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    if text.len() < 40 {
        return false;
    }
    let symbols = text
        .chars()
        .filter(|c| matches!(c, '{' | '}' | ';' | '(' | ')' | '[' | ']' | '<' | '>' | '='))
        .count();
    symbols as f64 / text.chars().count() as f64 > 0.05
}

/// Estimate token count for text content.
/// Approximation: len / 4 for prose, len / 3 for code.
pub fn estimate_text_tokens(text: &str) -> usize {
    let divisor = if looks_like_code(text) { 3 } else { 4 };
    text.len().div_ceil(divisor)
}

pub fn estimate_message_tokens(msg: &Message) -> usize {
    MESSAGE_OVERHEAD + estimate_text_tokens(&msg.text())
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
