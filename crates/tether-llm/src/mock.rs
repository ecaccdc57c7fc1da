use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use tether_core::errors::GatewayError;
use tether_core::ids::ToolCallId;
use tether_core::messages::{AssistantContent, AssistantMessage, Message, ToolCallBlock};
use tether_core::provider::{LlmProvider, ProviderResponse, SendOptions};
use tether_core::tokens::TokenUsage;

/// Pre-programmed responses for deterministic testing without a model.
#[derive(Clone, Debug)]
pub enum MockResponse {
    Reply(ProviderResponse),
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: &str) -> Self {
        Self::Reply(ProviderResponse {
            message: AssistantMessage::text(text),
            usage: TokenUsage::default(),
        })
    }

    pub fn text_with_usage(text: &str, input_tokens: u32, output_tokens: u32) -> Self {
        Self::Reply(ProviderResponse {
            message: AssistantMessage::text(text),
            usage: TokenUsage::new(input_tokens, output_tokens),
        })
    }

    /// A reply requesting a single tool invocation.
    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::tool_calls(vec![(name, arguments)])
    }

    pub fn tool_calls(calls: Vec<(&str, serde_json::Value)>) -> Self {
        let content = calls
            .into_iter()
            .map(|(name, arguments)| {
                AssistantContent::ToolCall(ToolCallBlock {
                    id: ToolCallId::new(),
                    name: name.to_string(),
                    arguments,
                })
            })
            .collect();
        Self::Reply(ProviderResponse {
            message: AssistantMessage { content },
            usage: TokenUsage::default(),
        })
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every message list it was sent.
pub struct MockProvider {
    responses: Vec<MockResponse>,
    fallback: Option<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses,
            fallback: None,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `fallback` once the scripted responses run out.
    pub fn with_fallback(mut self, fallback: MockResponse) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Message lists received so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<Vec<Message>> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        messages: &[Message],
        _options: &SendOptions,
    ) -> Result<ProviderResponse, GatewayError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(messages.to_vec());

        let response = match self.responses.get(idx).or(self.fallback.as_ref()) {
            Some(r) => r.clone(),
            None => {
                return Err(GatewayError::InvalidRequest(format!(
                    "MockProvider: no response configured for call {idx}"
                )))
            }
        };

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ProviderResponse, GatewayError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Reply(r) => return Ok(r),
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> SendOptions {
        SendOptions::default()
    }

    #[tokio::test]
    async fn sequential_responses_and_recording() {
        let mock = MockProvider::new(vec![MockResponse::text("first"), MockResponse::text("second")]);

        let r1 = mock.send(&[Message::user_text("a")], &opts()).await.unwrap();
        let r2 = mock.send(&[Message::user_text("b")], &opts()).await.unwrap();

        assert_eq!(r1.text(), "first");
        assert_eq!(r2.text(), "second");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.requests().len(), 2);
        assert_eq!(mock.last_request().unwrap(), vec![Message::user_text("b")]);
    }

    #[tokio::test]
    async fn exhausted_responses_error() {
        let mock = MockProvider::new(vec![MockResponse::text("only")]);
        let _ = mock.send(&[], &opts()).await;
        assert!(mock.send(&[], &opts()).await.is_err());
    }

    #[tokio::test]
    async fn fallback_repeats_forever() {
        let mock = MockProvider::new(vec![]).with_fallback(MockResponse::tool_call("noop", serde_json::json!({})));
        for _ in 0..5 {
            let r = mock.send(&[], &opts()).await.unwrap();
            assert!(r.message.has_tool_calls());
        }
    }

    #[tokio::test]
    async fn tool_call_reply_shape() {
        let mock = MockProvider::new(vec![MockResponse::tool_calls(vec![
            ("read_file", serde_json::json!({"path": "a.rs"})),
            ("grep", serde_json::json!({"pattern": "fn"})),
        ])]);
        let r = mock.send(&[], &opts()).await.unwrap();
        let calls = r.message.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].name, "grep");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(2),
            MockResponse::Error(GatewayError::RateLimited { retry_after: None }),
        )]);
        let start = tokio::time::Instant::now();
        let result = mock.send(&[], &opts()).await;
        assert!(matches!(result, Err(GatewayError::RateLimited { .. })));
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn usage_is_reported() {
        let mock = MockProvider::new(vec![MockResponse::text_with_usage("x", 120, 30)]);
        let r = mock.send(&[], &opts()).await.unwrap();
        assert_eq!(r.usage, TokenUsage::new(120, 30));
    }
}
