//! Last-resort extraction from unstructured text. Never fails.

use std::sync::LazyLock;

use regex::Regex;

use tether_core::result::{CompletionStatus, Confidence, Deliverables, NormalizedResult, ResultMetadata};

use crate::truncate::floor_boundary;

const MAX_ANALYSIS_BYTES: usize = 8 * 1024;
const EMPTY_OUTPUT: &str = "Provider returned no usable output.";

static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[-*•+]|\d{1,3}[.)])\s+(\S.*)$").unwrap());

static ERROR_INDICATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|exception|traceback|panicked|fatal|failed to|unable to|could not)\b").unwrap()
});

pub fn fallback(raw: &str, role: &str, recommendation_cap: usize) -> NormalizedResult {
    let blocks = prose_blocks(raw);
    let recommendations = list_items(raw, recommendation_cap);

    let mut analysis = blocks
        .iter()
        .find(|b| b.lines().count() > 1)
        .or_else(|| blocks.iter().max_by_key(|b| b.len()))
        .cloned();

    if analysis.is_none() && recommendations.is_empty() {
        let trimmed = raw.trim();
        analysis = Some(if trimmed.is_empty() {
            EMPTY_OUTPUT.to_string()
        } else {
            trimmed.to_string()
        });
    }

    let completion_status = if raw.trim().is_empty() || ERROR_INDICATOR.is_match(raw) {
        CompletionStatus::Failed
    } else {
        CompletionStatus::Partial
    };

    NormalizedResult {
        deliverables: Deliverables {
            analysis: analysis.map(|a| clip(&a)),
            recommendations,
            artifacts: Vec::new(),
        },
        memory_operations: Vec::new(),
        metadata: ResultMetadata {
            role: role.to_string(),
            completion_status,
            elapsed_ms: 0,
            confidence: Confidence::Low,
        },
    }
}

fn clip(text: &str) -> String {
    if text.len() <= MAX_ANALYSIS_BYTES {
        return text.to_string();
    }
    text[..floor_boundary(text, MAX_ANALYSIS_BYTES)].to_string()
}

/// Blank-line separated blocks outside code fences, with list lines removed.
fn prose_blocks(raw: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut in_fence = false;

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            flush(&mut blocks, &mut current);
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.is_empty() {
            flush(&mut blocks, &mut current);
        } else if !LIST_ITEM.is_match(line) {
            current.push(trimmed);
        }
    }
    flush(&mut blocks, &mut current);
    blocks
}

fn flush(blocks: &mut Vec<String>, current: &mut Vec<&str>) {
    if !current.is_empty() {
        blocks.push(current.join("\n"));
        current.clear();
    }
}

fn list_items(raw: &str, cap: usize) -> Vec<String> {
    let mut in_fence = false;
    let mut out = Vec::new();
    for line in raw.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(caps) = LIST_ITEM.captures(line) {
            out.push(caps[1].trim().to_string());
            if out.len() >= cap {
                break;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_multiline_block_and_list() {
        let raw = "Summary.\n\nThe service leaks connections\nunder sustained load.\n\n\
                   1. Add a pool limit\n2. Close idle sockets\n- Track pool metrics";
        let r = fallback(raw, "debugger", 5);
        assert_eq!(
            r.deliverables.analysis.as_deref(),
            Some("The service leaks connections\nunder sustained load.")
        );
        assert_eq!(
            r.deliverables.recommendations,
            ["Add a pool limit", "Close idle sockets", "Track pool metrics"]
        );
        assert_eq!(r.status(), CompletionStatus::Partial);
        assert_eq!(r.metadata.confidence, Confidence::Low);
        assert_eq!(r.metadata.role, "debugger");
    }

    #[test]
    fn recommendations_capped() {
        let raw = (1..=9).map(|i| format!("- item {i}")).collect::<Vec<_>>().join("\n");
        let r = fallback(&raw, "r", 5);
        assert_eq!(r.deliverables.recommendations.len(), 5);
        assert!(r.deliverables.analysis.is_none());
        assert!(!r.deliverables.is_empty());
    }

    #[test]
    fn fenced_content_skipped() {
        let raw = "```\nlet a = 1;\nlet b = 2;\n- not a list\n```\nOne line of prose.";
        let r = fallback(raw, "r", 5);
        assert_eq!(r.deliverables.analysis.as_deref(), Some("One line of prose."));
        assert!(r.deliverables.recommendations.is_empty());
    }

    #[test]
    fn error_text_marks_failed() {
        let r = fallback("Traceback (most recent call last):\n  boom", "r", 5);
        assert_eq!(r.status(), CompletionStatus::Failed);
    }

    #[test]
    fn empty_input_is_failed_placeholder() {
        let r = fallback("", "r", 5);
        assert_eq!(r.status(), CompletionStatus::Failed);
        assert_eq!(r.deliverables.analysis.as_deref(), Some(EMPTY_OUTPUT));
    }

    #[test]
    fn binary_noise_still_shaped() {
        let raw: String = (0u8..=255).map(char::from).collect();
        let r = fallback(&raw, "r", 5);
        assert!(!r.deliverables.is_empty());
    }

    #[test]
    fn analysis_is_clipped_on_char_boundary() {
        let raw = "é".repeat(MAX_ANALYSIS_BYTES);
        let r = fallback(&raw, "r", 5);
        let a = r.deliverables.analysis.unwrap();
        assert!(a.len() <= MAX_ANALYSIS_BYTES);
    }
}
