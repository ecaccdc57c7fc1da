use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use tether_core::messages::Message;
use tether_core::provider::{LlmProvider, SendOptions};

use crate::truncate::truncate_output;

const MAX_MALFORMED_BYTES: usize = 16 * 1024;

const CORRECTION_PROMPT: &str = "You repair malformed JSON produced by another agent. \
Reply with a single JSON object and nothing else. The object must have a \"deliverables\" \
object (\"analysis\" string, \"recommendations\" array of strings, \"artifacts\" array), \
a \"memory_operations\" array and a \"metadata\" object with \"completion_status\" \
(complete, partial or failed) and \"confidence\" (high, medium or low). Keep the original \
content; do not invent findings.";

/// Strategy for turning unparseable output into something the normalizer
/// can read. Returning `None` ends correction.
#[async_trait]
pub trait Corrector: Send + Sync {
    async fn correct(&self, malformed: &str, role: &str) -> Option<String>;
}

/// Corrector backed by one short provider round-trip per attempt.
pub struct ProviderCorrector {
    provider: Arc<dyn LlmProvider>,
    options: SendOptions,
}

impl ProviderCorrector {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            options: SendOptions {
                max_tokens: 2048,
                temperature: 0.0,
            },
        }
    }

    pub fn with_options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }
}

#[async_trait]
impl Corrector for ProviderCorrector {
    async fn correct(&self, malformed: &str, role: &str) -> Option<String> {
        let messages = [
            Message::system_text(CORRECTION_PROMPT),
            Message::user_text(format!(
                "Role: {role}\n\nMalformed output:\n{}",
                truncate_output(malformed, MAX_MALFORMED_BYTES)
            )),
        ];
        match self.provider.send(&messages, &self.options).await {
            Ok(response) => {
                let text = response.text();
                (!text.trim().is_empty()).then_some(text)
            }
            Err(e) => {
                warn!(role, provider = self.provider.name(), error = %e, "correction round-trip failed");
                None
            }
        }
    }
}
