use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{error, warn};

use tether_core::tools::{Tool, ToolDefinition, ToolExecutor};

use crate::truncate::{truncate_output, DEFAULT_MAX_TOOL_OUTPUT};

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// Registry of named tools, usable as the pipeline's tool executor.
///
/// Execution never fails outward: unknown tools, tool errors, panics and
/// timeouts all come back as `[error] ...` result text.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    tool_timeout: Duration,
    max_output_bytes: usize,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_TOOL_OUTPUT,
        }
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_max_output(mut self, max_bytes: usize) -> Self {
        self.max_output_bytes = max_bytes;
        self
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(Arc::clone)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions advertised to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    async fn execute(&self, name: &str, args: &serde_json::Value) -> String {
        let Some(tool) = self.get(name) else {
            warn!(tool = name, "unknown tool requested");
            return format!("[error] Unknown tool: {name}");
        };

        let result = tokio::time::timeout(
            self.tool_timeout,
            AssertUnwindSafe(tool.execute(args.clone())).catch_unwind(),
        )
        .await;

        let content = match result {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(e))) => format!("[error] {e}"),
            Ok(Err(panic)) => {
                error!(tool = name, panic = %panic_message(&panic), "tool panicked during execution");
                "[error] Internal error: tool crashed".to_string()
            }
            Err(_) => {
                warn!(tool = name, timeout_secs = self.tool_timeout.as_secs(), "tool timed out");
                format!("[error] Tool timed out after {}s", self.tool_timeout.as_secs())
            }
        };
        truncate_output(&content, self.max_output_bytes)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
