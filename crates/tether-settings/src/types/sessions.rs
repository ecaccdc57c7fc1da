//! Session store limits and persistence location.

use serde::{Deserialize, Serialize};

/// Safety ceilings enforced by the session store before any work is dispatched.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Directory holding `active/`, `completed/` and `refinements/`.
    /// Empty means `~/.tether/sessions`.
    pub root: String,
    /// Deepest allowed child session (top-level sessions are depth 0).
    pub max_depth: u32,
    /// Provider calls allowed across one session lineage.
    pub max_total_calls: u32,
    /// Refinements allowed per task fingerprint.
    pub max_refinements: u32,
    /// Largest batch accepted by a parallel spawn.
    pub max_parallel_agents: usize,
    /// Sessions idle longer than this are swept.
    pub idle_timeout_secs: u64,
    /// Whether a sub-agent session may itself admit children.
    pub allow_nested_spawn: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            root: String::new(),
            max_depth: 2,
            max_total_calls: 50,
            max_refinements: 3,
            max_parallel_agents: 4,
            idle_timeout_secs: 3600,
            allow_nested_spawn: false,
        }
    }
}
