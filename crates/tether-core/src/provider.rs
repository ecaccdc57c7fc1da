use async_trait::async_trait;

use crate::errors::GatewayError;
use crate::messages::{AssistantMessage, Message};
use crate::tokens::TokenUsage;

/// Generation options for a single provider request.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOptions {
    pub max_tokens: u32,
    pub temperature: f64,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.2,
        }
    }
}

/// One complete provider reply.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProviderResponse {
    pub message: AssistantMessage,
    pub usage: TokenUsage,
}

impl ProviderResponse {
    pub fn text(&self) -> String {
        self.message.text_content()
    }
}

/// Transport-agnostic model endpoint.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        messages: &[Message],
        options: &SendOptions,
    ) -> Result<ProviderResponse, GatewayError>;
}
