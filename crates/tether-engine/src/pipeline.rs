//! Invocation Pipeline: one attempt from assembled prompt to final answer.
//!
//! `Building -> Calling -> (ToolExecuting -> Calling)* -> Completed`, or
//! `TimedOut` / `ProviderError` / `ToolRoundsExceeded`. Provider errors are
//! not retried here.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use tether_core::errors::GatewayError;
use tether_core::messages::{ConversationRecord, Message, ToolCallBlock};
use tether_core::provider::{LlmProvider, SendOptions};
use tether_core::role::RoleDefinition;
use tether_core::tokens::AccumulatedUsage;
use tether_core::tools::ToolExecutor;
use tether_settings::PipelineSettings;
use tether_telemetry::metrics::{names, MetricsRecorder};

use crate::context::ContextWindowManager;
use crate::truncate::{truncate_output, DEFAULT_MAX_TOOL_OUTPUT};

const RESPONSE_FORMAT: &str = "\n\n## Response Format\n\
Reply with one JSON object and nothing else:\n\
{\"deliverables\": {\"analysis\": string, \"recommendations\": [string], \"artifacts\": [any]},\n \
\"memory_operations\": [{\"operation\": string, \"payload\": object}],\n \
\"metadata\": {\"completion_status\": \"complete\" | \"partial\" | \"failed\", \
\"confidence\": \"high\" | \"medium\" | \"low\"}}";

/// Conversation produced by an attempt that reached a final answer.
#[derive(Clone, Debug)]
pub struct CompletedAttempt {
    pub conversation: ConversationRecord,
    pub final_text: String,
    pub tool_rounds: u32,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum AttemptOutcome {
    Completed(CompletedAttempt),
    TimedOut { elapsed: Duration, tool_rounds: u32 },
    ProviderError { error: GatewayError, elapsed: Duration },
    ToolRoundsExceeded { rounds: u32, elapsed: Duration },
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed(_) => "completed",
            Self::TimedOut { .. } => "timed_out",
            Self::ProviderError { .. } => "provider_error",
            Self::ToolRoundsExceeded { .. } => "tool_rounds_exceeded",
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Self::Completed(done) => done.elapsed,
            Self::TimedOut { elapsed, .. }
            | Self::ProviderError { elapsed, .. }
            | Self::ToolRoundsExceeded { elapsed, .. } => *elapsed,
        }
    }

    /// Human-readable reason for a non-completed outcome.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::TimedOut { elapsed, .. } => Some(format!("attempt timed out after {}ms", elapsed.as_millis())),
            Self::ProviderError { error, .. } => Some(format!("provider error: {error}")),
            Self::ToolRoundsExceeded { rounds, .. } => {
                Some(format!("tool-call loop stopped after {rounds} rounds"))
            }
        }
    }
}

enum Interrupted {
    Provider(GatewayError),
    RoundCap,
}

pub struct InvocationPipeline {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    context: Arc<ContextWindowManager>,
    settings: PipelineSettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl InvocationPipeline {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolExecutor>,
        context: Arc<ContextWindowManager>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            context,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// `Building`: system prompt from the role, user turn from the
    /// compressed context.
    pub fn build_conversation(role: &RoleDefinition, prompt: &str) -> ConversationRecord {
        let mut conversation = ConversationRecord::new();
        conversation.push(Message::system_text(format!("{}{RESPONSE_FORMAT}", role.system_prompt.trim_end())));
        conversation.push(Message::user_text(prompt));
        conversation
    }

    /// Run one attempt on a copy of `conversation` under `timeout`.
    ///
    /// Usage is charged to `usage` as each provider reply arrives, so calls
    /// made before a timeout are still counted. The caller's record is only
    /// replaced by the returned conversation on completion.
    #[instrument(skip_all, fields(provider = self.provider.name(), messages = conversation.len()))]
    pub async fn run(
        &self,
        conversation: &ConversationRecord,
        timeout: Duration,
        usage: &mut AccumulatedUsage,
    ) -> AttemptOutcome {
        let start = Instant::now();
        let mut working = conversation.clone();
        let mut rounds = 0u32;

        let result = tokio::time::timeout(timeout, self.drive(&mut working, usage, &mut rounds)).await;
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(Ok(final_text)) => AttemptOutcome::Completed(CompletedAttempt {
                conversation: working,
                final_text,
                tool_rounds: rounds,
                elapsed,
            }),
            Ok(Err(Interrupted::Provider(error))) => {
                warn!(error = %error, kind = error.error_kind(), "provider call failed");
                AttemptOutcome::ProviderError { error, elapsed }
            }
            Ok(Err(Interrupted::RoundCap)) => {
                warn!(rounds, "tool round cap reached");
                AttemptOutcome::ToolRoundsExceeded { rounds, elapsed }
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, rounds, "attempt timed out");
                AttemptOutcome::TimedOut {
                    elapsed,
                    tool_rounds: rounds,
                }
            }
        };

        if let Some(m) = &self.metrics {
            m.counter_inc(names::PIPELINE_OUTCOME, &[("outcome", outcome.as_str())], 1);
            m.histogram_observe(names::PIPELINE_TOOL_ROUNDS, &[], rounds as f64);
            m.histogram_observe(names::PIPELINE_ATTEMPT_MS, &[], elapsed.as_millis() as f64);
        }
        debug!(outcome = outcome.as_str(), rounds, elapsed_ms = elapsed.as_millis() as u64, "attempt finished");
        outcome
    }

    async fn drive(
        &self,
        conversation: &mut ConversationRecord,
        usage: &mut AccumulatedUsage,
        rounds: &mut u32,
    ) -> Result<String, Interrupted> {
        let options = SendOptions {
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        loop {
            let pruned = self.context.prune(conversation.messages());
            let response = self
                .provider
                .send(&pruned.messages, &options)
                .await
                .map_err(Interrupted::Provider)?;
            usage.accumulate(&response.usage);

            if !response.message.has_tool_calls() {
                let text = response.text();
                conversation.push(Message::Assistant(response.message));
                return Ok(text);
            }

            if self.settings.max_tool_rounds.is_some_and(|max| *rounds >= max) {
                return Err(Interrupted::RoundCap);
            }
            *rounds += 1;

            let calls: Vec<ToolCallBlock> = response.message.tool_calls().into_iter().cloned().collect();
            conversation.push(Message::Assistant(response.message));

            // one at a time: later arguments may depend on earlier results
            for call in calls {
                debug!(tool = %call.name, round = *rounds, "executing tool");
                let output = self.tools.execute(&call.name, &call.arguments).await;
                conversation.push(Message::tool_result(
                    call.id,
                    truncate_output(&output, DEFAULT_MAX_TOOL_OUTPUT),
                ));
            }
        }
    }
}
