//! Conversation history pruning for provider calls.
//!
//! Works on a copy of the conversation; the authoritative record is never
//! modified. Tool results stay attached to the assistant message that
//! requested them, so a pruned history never starts with an orphaned
//! tool result.

use tether_core::messages::{AssistantContent, AssistantMessage, Message, ToolResultMessage};
use tether_settings::ContextSettings;

use super::tokens::estimate_messages_tokens;
use crate::truncate::{floor_boundary, truncate_output};

const PREVIEW_MAX_BYTES: usize = 2048;

/// Result of pruning a message history.
#[derive(Clone, Debug, PartialEq)]
pub struct PrunedHistory {
    pub messages: Vec<Message>,
    /// Messages removed by the window or by emergency pruning.
    pub dropped: usize,
    pub emergency: bool,
    pub estimated_tokens: usize,
}

/// Prune `messages` for the next provider call.
///
/// 1. Keep the leading system message.
/// 2. Keep the most recent `max_history_messages` non-system messages.
/// 3. Summarize tool results, trim long code fences in assistant text,
///    truncate long user messages.
/// 4. If still over `history_budget_tokens`, keep the system message and
///    walk newest-first until the budget is reached.
pub fn prune_history(messages: &[Message], settings: &ContextSettings) -> PrunedHistory {
    let (system, rest) = match messages.split_first() {
        Some((first, rest)) if first.is_system() => (Some(first.clone()), rest),
        _ => (None, messages),
    };

    let groups = exchange_groups(rest);
    let mut start = rest.len();
    for group in groups.iter().rev() {
        let len = rest.len() - group.start;
        if len > settings.max_history_messages && start < rest.len() {
            break;
        }
        start = group.start;
    }
    let windowed = &rest[start..];

    let compacted: Vec<Message> = windowed.iter().map(|m| compact_message(m, settings)).collect();

    let system_tokens = system.as_ref().map_or(0, |s| estimate_messages_tokens(std::slice::from_ref(s)));
    let mut emergency = false;
    let kept = if system_tokens + estimate_messages_tokens(&compacted) > settings.history_budget_tokens {
        emergency = true;
        emergency_prune(&compacted, settings.history_budget_tokens.saturating_sub(system_tokens))
    } else {
        compacted
    };

    let dropped = rest.len() - kept.len();
    let mut out = Vec::with_capacity(kept.len() + 1);
    out.extend(system);
    out.extend(kept);
    let estimated_tokens = estimate_messages_tokens(&out);

    PrunedHistory {
        messages: out,
        dropped,
        emergency,
        estimated_tokens,
    }
}

/// Keep whole exchanges newest-first until `budget` tokens are used.
/// The newest exchange is always kept.
fn emergency_prune(messages: &[Message], budget: usize) -> Vec<Message> {
    let groups = exchange_groups(messages);
    let mut used = 0usize;
    let mut start = messages.len();

    for group in groups.iter().rev() {
        let cost = estimate_messages_tokens(&messages[group.clone()]);
        if used + cost > budget && start < messages.len() {
            break;
        }
        used += cost;
        start = group.start;
    }
    messages[start..].to_vec()
}

/// Split into ranges where an assistant message owns the tool results that
/// immediately follow it.
fn exchange_groups(messages: &[Message]) -> Vec<std::ops::Range<usize>> {
    let mut groups: Vec<std::ops::Range<usize>> = Vec::new();
    for (i, msg) in messages.iter().enumerate() {
        let attach = matches!(msg, Message::Tool(_))
            && groups
                .last()
                .is_some_and(|g| matches!(messages[g.start], Message::Assistant(_)) || matches!(messages[g.start], Message::Tool(_)));
        match groups.last_mut() {
            Some(last) if attach => last.end = i + 1,
            _ => groups.push(i..i + 1),
        }
    }
    groups
}

fn compact_message(msg: &Message, settings: &ContextSettings) -> Message {
    match msg {
        Message::Tool(t) => Message::Tool(ToolResultMessage {
            tool_call_id: t.tool_call_id.clone(),
            content: summarize_tool_result(&t.content, settings.tool_preview_lines),
        }),
        Message::Assistant(a) => Message::Assistant(AssistantMessage {
            content: a
                .content
                .iter()
                .map(|c| match c {
                    AssistantContent::Text { text } => AssistantContent::Text {
                        text: trim_code_fences(
                            text,
                            settings.code_fence_max_lines,
                            settings.code_fence_head_lines,
                            settings.code_fence_tail_lines,
                        ),
                    },
                    other => other.clone(),
                })
                .collect(),
        }),
        Message::User(u) if u.content.len() > settings.user_message_max_chars => {
            Message::user_text(truncate_output(&u.content, settings.user_message_max_chars))
        }
        other => other.clone(),
    }
}

/// Reduce a tool or file result to status/path/line-count/preview.
///
/// Results no longer than `preview_lines` lines are kept as-is. JSON object
/// results keep only their status and path fields plus a line count and a
/// preview of the body; plain text keeps a structural preview (declaration
/// lines when there are any, otherwise the first lines).
pub fn summarize_tool_result(content: &str, preview_lines: usize) -> String {
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(content) {
        let body = ["content", "output", "stdout", "body", "text"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_str()));
        if let Some(body) = body.filter(|b| b.lines().count() > preview_lines) {
            let mut summary = serde_json::Map::new();
            for key in ["status", "success", "error", "path", "file", "exit_code"] {
                if let Some(v) = map.get(key) {
                    summary.insert(key.to_string(), v.clone());
                }
            }
            summary.insert("line_count".into(), body.lines().count().into());
            summary.insert("preview".into(), structural_preview(body, preview_lines).into());
            return serde_json::Value::Object(summary).to_string();
        }
    }

    let line_count = content.lines().count();
    if line_count <= preview_lines && content.len() <= PREVIEW_MAX_BYTES {
        return content.to_string();
    }
    format!(
        "[tool result: {line_count} lines, {} bytes]\n{}\n[... preview only ...]",
        content.len(),
        structural_preview(content, preview_lines)
    )
}

fn structural_preview(body: &str, max_lines: usize) -> String {
    const MARKERS: &[&str] = &[
        "fn ", "pub ", "struct ", "enum ", "impl ", "trait ", "class ", "def ", "interface ", "func ", "export ", "type ",
        "mod ", "#",
    ];
    let structural: Vec<&str> = body
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            MARKERS.iter().any(|m| t.starts_with(m))
        })
        .take(max_lines)
        .collect();
    let lines = if structural.is_empty() {
        body.lines().take(max_lines).collect::<Vec<_>>()
    } else {
        structural
    };
    let joined = lines.join("\n");
    let cut = floor_boundary(&joined, PREVIEW_MAX_BYTES);
    joined[..cut].to_string()
}

/// Replace fenced blocks longer than `max_lines` with head + elision + tail.
pub fn trim_code_fences(text: &str, max_lines: usize, head: usize, tail: usize) -> String {
    if !text.contains("```") {
        return text.to_string();
    }

    let mut out: Vec<String> = Vec::new();
    let mut block: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            if in_fence {
                out.extend(elide(&block, max_lines, head, tail));
                block.clear();
            }
            in_fence = !in_fence;
            out.push(line.to_string());
        } else if in_fence {
            block.push(line);
        } else {
            out.push(line.to_string());
        }
    }
    // unterminated fence: keep what we have
    out.extend(block.iter().map(|l| l.to_string()));
    out.join("\n")
}

fn elide(block: &[&str], max_lines: usize, head: usize, tail: usize) -> Vec<String> {
    if block.len() <= max_lines || head + tail >= block.len() {
        return block.iter().map(|l| l.to_string()).collect();
    }
    let mut out: Vec<String> = block[..head].iter().map(|l| l.to_string()).collect();
    out.push(format!("// ... {} lines elided ...", block.len() - head - tail));
    out.extend(block[block.len() - tail..].iter().map(|l| l.to_string()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::ids::ToolCallId;
    use tether_core::messages::ToolCallBlock;

    fn settings() -> ContextSettings {
        ContextSettings {
            max_history_messages: 4,
            history_budget_tokens: 10_000,
            ..Default::default()
        }
    }

    fn tool_exchange(name: &str, result: &str) -> Vec<Message> {
        let id = ToolCallId::new();
        vec![
            Message::Assistant(AssistantMessage {
                content: vec![AssistantContent::ToolCall(ToolCallBlock {
                    id: id.clone(),
                    name: name.into(),
                    arguments: serde_json::json!({}),
                })],
            }),
            Message::tool_result(id, result),
        ]
    }

    #[test]
    fn keeps_system_and_recent_window() {
        let mut msgs = vec![Message::system_text("sys")];
        for i in 0..10 {
            msgs.push(Message::user_text(format!("u{i}")));
            msgs.push(Message::assistant_text(format!("a{i}")));
        }
        let pruned = prune_history(&msgs, &settings());

        assert!(pruned.messages[0].is_system());
        assert_eq!(pruned.messages.len(), 5);
        assert_eq!(pruned.messages[1].text(), "u8");
        assert_eq!(pruned.messages[4].text(), "a9");
        assert_eq!(pruned.dropped, 16);
        assert!(!pruned.emergency);
    }

    #[test]
    fn window_never_splits_tool_exchange() {
        let mut msgs = vec![Message::system_text("sys"), Message::user_text("task")];
        msgs.extend(tool_exchange("a", "r1"));
        msgs.push(Message::user_text("more"));
        let id = ToolCallId::new();
        msgs.push(Message::Assistant(AssistantMessage {
            content: vec![
                AssistantContent::ToolCall(ToolCallBlock { id: id.clone(), name: "x".into(), arguments: serde_json::json!({}) }),
                AssistantContent::ToolCall(ToolCallBlock { id: ToolCallId::new(), name: "y".into(), arguments: serde_json::json!({}) }),
            ],
        }));
        msgs.push(Message::tool_result(id, "rx"));
        msgs.push(Message::tool_result(ToolCallId::new(), "ry"));

        let pruned = prune_history(&msgs, &settings());
        // first kept non-system message must not be a tool result
        assert!(!matches!(pruned.messages[1], Message::Tool(_)));
        assert!(matches!(pruned.messages.last(), Some(Message::Tool(_))));
    }

    #[test]
    fn emergency_keeps_newest_exchange() {
        let big = "word ".repeat(400);
        let mut msgs = vec![Message::system_text("sys")];
        msgs.push(Message::user_text(big.clone()));
        msgs.push(Message::assistant_text(big.clone()));
        msgs.push(Message::user_text("latest question"));

        let s = ContextSettings {
            history_budget_tokens: 50,
            ..settings()
        };
        let pruned = prune_history(&msgs, &s);
        assert!(pruned.emergency);
        assert!(pruned.messages[0].is_system());
        assert_eq!(pruned.messages.last().unwrap().text(), "latest question");
        assert_eq!(pruned.messages.len(), 2);
    }

    #[test]
    fn emergency_keeps_newest_even_when_oversized() {
        let msgs = vec![Message::system_text("sys"), Message::user_text("x".repeat(4000))];
        let s = ContextSettings {
            history_budget_tokens: 10,
            user_message_max_chars: 100_000,
            ..settings()
        };
        let pruned = prune_history(&msgs, &s);
        assert_eq!(pruned.messages.len(), 2);
    }

    #[test]
    fn source_is_untouched() {
        let msgs = vec![Message::user_text("x".repeat(10_000))];
        let before = msgs.clone();
        let pruned = prune_history(&msgs, &settings());
        assert_eq!(msgs, before);
        assert!(pruned.messages[0].text().contains("[truncated:"));
    }

    #[test]
    fn tool_json_summarized() {
        let body: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let content = serde_json::json!({"status": "ok", "path": "src/lib.rs", "content": body, "extra": "dropped"}).to_string();
        let summary = summarize_tool_result(&content, 3);
        let v: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["path"], "src/lib.rs");
        assert_eq!(v["line_count"], 50);
        assert_eq!(v["preview"], "line 0\nline 1\nline 2");
        assert!(v.get("extra").is_none());
    }

    #[test]
    fn tool_text_structural_preview() {
        let mut body = String::new();
        for i in 0..30 {
            body.push_str(&format!("    let x{i} = {i};\n"));
            if i % 10 == 0 {
                body.push_str(&format!("pub fn f{i}() {{\n"));
            }
        }
        let summary = summarize_tool_result(&body, 8);
        assert!(summary.starts_with("[tool result:"));
        assert!(summary.contains("pub fn f0() {"));
        assert!(summary.contains("pub fn f20() {"));
        assert!(!summary.contains("let x5"));
    }

    #[test]
    fn short_tool_result_unchanged() {
        assert_eq!(summarize_tool_result("ok", 8), "ok");
    }

    #[test]
    fn long_fence_trimmed() {
        let code: Vec<String> = (0..50).map(|i| format!("line{i}")).collect();
        let text = format!("Before\n```rust\n{}\n```\nAfter", code.join("\n"));
        let trimmed = trim_code_fences(&text, 40, 3, 2);
        assert!(trimmed.contains("line0\nline1\nline2\n// ... 45 lines elided ...\nline48\nline49"));
        assert!(trimmed.starts_with("Before\n```rust"));
        assert!(trimmed.ends_with("```\nAfter"));
    }

    #[test]
    fn short_fence_kept() {
        let text = "```\na\nb\n```";
        assert_eq!(trim_code_fences(text, 40, 3, 2), text);
    }
}
