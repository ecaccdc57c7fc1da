//! Context window manager settings: tier allocation and history pruning.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextSettings {
    /// Token budget used when a request doesn't name one.
    pub default_budget_tokens: usize,
    /// Share of the budget reserved for the task text.
    pub task_share: f64,
    /// Share for critical and domain material.
    pub critical_share: f64,
    /// Share for general background.
    pub general_share: f64,
    /// Non-system messages kept when pruning history.
    pub max_history_messages: usize,
    /// Token budget for a pruned history before emergency pruning.
    pub history_budget_tokens: usize,
    /// Assistant code fences longer than this are trimmed.
    pub code_fence_max_lines: usize,
    pub code_fence_head_lines: usize,
    pub code_fence_tail_lines: usize,
    /// User messages longer than this are truncated.
    pub user_message_max_chars: usize,
    /// Lines of file content kept in a tool-result preview.
    pub tool_preview_lines: usize,
    /// Compression ratio under which the integrity check fails.
    pub min_compression_ratio: f64,
    /// Accept compression below `min_compression_ratio` without a violation.
    pub allow_aggressive: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            default_budget_tokens: 4000,
            task_share: 0.3,
            critical_share: 0.4,
            general_share: 0.3,
            max_history_messages: 20,
            history_budget_tokens: 24_000,
            code_fence_max_lines: 40,
            code_fence_head_lines: 12,
            code_fence_tail_lines: 6,
            user_message_max_chars: 8000,
            tool_preview_lines: 8,
            min_compression_ratio: 0.1,
            allow_aggressive: false,
        }
    }
}
