//! Orchestrator: composition root for one sub-agent request.
//!
//! admission -> compression -> attempt -> normalize -> validate ->
//! refine or finalize -> memory forwarding -> session completion.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, instrument, warn};

use tether_core::fingerprint::TaskFingerprint;
use tether_core::ids::SessionId;
use tether_core::memory::MemorySink;
use tether_core::messages::Message;
use tether_core::provider::LlmProvider;
use tether_core::quality::QualityAssessment;
use tether_core::result::{CompletionStatus, MemoryOperation, NormalizedResult, ParseStage};
use tether_core::role::{RoleCatalog, RoleDefinition, Urgency};
use tether_core::tokens::AccumulatedUsage;
use tether_core::tools::{NoTools, ToolExecutor};
use tether_settings::TetherSettings;
use tether_store::{AdmissionError, SessionRecord, SessionStore, StoreError};
use tether_telemetry::metrics::MetricsRecorder;

use crate::context::{CompressRequest, ContextWindowManager};
use crate::error::EngineError;
use crate::normalizer::{Corrector, ResponseNormalizer};
use crate::pipeline::{AttemptOutcome, InvocationPipeline};
use crate::quality::{QualityValidator, ValidationContext};
use crate::refinement::{RefinementController, RefinementDecision, StopReason};

/// One sub-agent request.
#[derive(Clone, Debug)]
pub struct SpawnRequest {
    pub role: String,
    pub task: String,
    pub context: String,
    pub deliverable_spec: String,
    pub urgency: Urgency,
    pub max_budget_tokens: Option<usize>,
    /// Overrides the urgency-derived attempt timeout.
    pub timeout: Option<Duration>,
    pub parent_session: Option<SessionId>,
}

impl SpawnRequest {
    pub fn new(role: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task: task.into(),
            context: String::new(),
            deliverable_spec: String::new(),
            urgency: Urgency::default(),
            max_budget_tokens: None,
            timeout: None,
            parent_session: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_deliverable_spec(mut self, spec: impl Into<String>) -> Self {
        self.deliverable_spec = spec.into();
        self
    }

    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    pub fn with_budget(mut self, tokens: usize) -> Self {
        self.max_budget_tokens = Some(tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_parent(mut self, parent: SessionId) -> Self {
        self.parent_session = Some(parent);
        self
    }
}

/// Accounting returned alongside every result.
#[derive(Clone, Debug, Serialize)]
pub struct UsageMetadata {
    pub session_id: SessionId,
    pub fingerprint: TaskFingerprint,
    pub attempts: u32,
    pub refinements: u32,
    pub tool_rounds: u32,
    pub tokens: AccumulatedUsage,
    pub elapsed_ms: u64,
    /// Stage that produced the retained result.
    pub parse_stage: ParseStage,
    pub stop_reason: StopReason,
    pub scores: Vec<f64>,
    pub compression_ratio: f64,
    pub context_warnings: Vec<String>,
    pub memory_operations_forwarded: usize,
}

#[derive(Clone, Debug)]
pub struct SpawnOutcome {
    pub result: NormalizedResult,
    pub assessment: QualityAssessment,
    pub usage: UsageMetadata,
}

struct Candidate {
    result: NormalizedResult,
    assessment: QualityAssessment,
    stage: ParseStage,
}

pub struct Orchestrator {
    settings: Arc<TetherSettings>,
    store: Arc<SessionStore>,
    roles: Arc<dyn RoleCatalog>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolExecutor>,
    corrector: Option<Arc<dyn Corrector>>,
    memory_sink: Option<Arc<dyn MemorySink>>,
    metrics: Option<Arc<MetricsRecorder>>,
    context: Arc<ContextWindowManager>,
    pipeline: InvocationPipeline,
    normalizer: ResponseNormalizer,
    validator: QualityValidator,
    refinement: RefinementController,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<TetherSettings>,
        store: Arc<SessionStore>,
        provider: Arc<dyn LlmProvider>,
        roles: Arc<dyn RoleCatalog>,
    ) -> Self {
        let tools: Arc<dyn ToolExecutor> = Arc::new(NoTools);
        let context = Arc::new(ContextWindowManager::new(settings.context.clone()));
        Self {
            pipeline: InvocationPipeline::new(
                Arc::clone(&provider),
                Arc::clone(&tools),
                Arc::clone(&context),
                settings.pipeline.clone(),
            ),
            normalizer: ResponseNormalizer::new(settings.normalizer.clone()),
            validator: QualityValidator::new(settings.quality.clone()),
            refinement: RefinementController::new(settings.refinement.clone(), Arc::clone(&store)),
            context,
            settings,
            store,
            roles,
            provider,
            tools,
            corrector: None,
            memory_sink: None,
            metrics: None,
        }
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolExecutor>) -> Self {
        self.tools = tools;
        self.assemble()
    }

    pub fn with_corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self.assemble()
    }

    pub fn with_memory_sink(mut self, sink: Arc<dyn MemorySink>) -> Self {
        self.memory_sink = Some(sink);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self.assemble()
    }

    /// Rebuild the components after a collaborator changed.
    fn assemble(mut self) -> Self {
        let s = Arc::clone(&self.settings);
        let mut context = ContextWindowManager::new(s.context.clone());
        let mut normalizer = ResponseNormalizer::new(s.normalizer.clone());
        let mut validator = QualityValidator::new(s.quality.clone());
        let mut refinement = RefinementController::new(s.refinement.clone(), Arc::clone(&self.store));
        if let Some(corrector) = &self.corrector {
            normalizer = normalizer.with_corrector(Arc::clone(corrector));
        }
        if let Some(m) = &self.metrics {
            context = context.with_metrics(Arc::clone(m));
            normalizer = normalizer.with_metrics(Arc::clone(m));
            validator = validator.with_metrics(Arc::clone(m));
            refinement = refinement.with_metrics(Arc::clone(m));
        }

        let context = Arc::new(context);
        let mut pipeline = InvocationPipeline::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.tools),
            Arc::clone(&context),
            s.pipeline.clone(),
        );
        if let Some(m) = &self.metrics {
            pipeline = pipeline.with_metrics(Arc::clone(m));
        }

        self.context = context;
        self.pipeline = pipeline;
        self.normalizer = normalizer;
        self.validator = validator;
        self.refinement = refinement;
        self
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Open a session the caller will use as a parent for spawned agents.
    pub fn begin_session(&self, parent: Option<&SessionId>) -> Result<SessionId, EngineError> {
        Ok(self.store.admit(parent)?)
    }

    pub fn end_session(&self, id: &SessionId) -> Result<SessionRecord, EngineError> {
        Ok(self.store.complete(id)?)
    }

    /// Run one sub-agent request to a final result.
    ///
    /// Admission errors are returned as errors. Transport failures come back
    /// as a `failed` result. The session created for the request is
    /// completed before returning.
    #[instrument(skip_all, fields(role = %req.role, urgency = req.urgency.as_str()))]
    pub async fn spawn_agent(&self, req: SpawnRequest) -> Result<SpawnOutcome, EngineError> {
        let role = self.roles.get_role(&req.role)?;
        let session_id = self.store.admit(req.parent_session.as_ref())?;
        info!(session_id = %session_id, parent = ?req.parent_session, "agent session admitted");

        let outcome = self.run_session(&session_id, &role, &req).await;

        if let Err(e) = self.store.complete(&session_id) {
            warn!(session_id = %session_id, error = %e, "failed to complete session");
        }
        outcome
    }

    /// Run a batch after a single parallel admission check.
    ///
    /// The outer error is the batch rejection; each request then succeeds
    /// or fails on its own.
    pub async fn spawn_parallel(
        &self,
        requests: Vec<SpawnRequest>,
    ) -> Result<Vec<Result<SpawnOutcome, EngineError>>, EngineError> {
        let requested = requests.len();
        if !self.store.admit_parallel(requested) {
            let max = self.store.limits().max_parallel_agents;
            warn!(requested, max, "parallel batch rejected");
            return Err(AdmissionError::ParallelLimitExceeded { requested, max }.into());
        }
        Ok(join_all(requests.into_iter().map(|r| self.spawn_agent(r))).await)
    }

    async fn run_session(
        &self,
        session_id: &SessionId,
        role: &RoleDefinition,
        req: &SpawnRequest,
    ) -> Result<SpawnOutcome, EngineError> {
        let fingerprint = TaskFingerprint::compute(&req.task, &req.context, &role.name);
        let budget = req.max_budget_tokens.unwrap_or(self.settings.context.default_budget_tokens);
        let compressed = self.context.compress(CompressRequest {
            task: &req.task,
            background: &req.context,
            deliverable_spec: &req.deliverable_spec,
            budget_tokens: budget,
            domain_keywords: &role.domain_keywords,
        });
        let timeout = req
            .timeout
            .unwrap_or_else(|| self.settings.pipeline.urgency_timeouts_secs.timeout_for(req.urgency));

        let mut conversation = InvocationPipeline::build_conversation(role, &compressed.text);
        let mut tokens = AccumulatedUsage::default();
        let mut attempts = 0u32;
        let mut refinements = 0u32;
        let mut tool_rounds = 0u32;
        let mut elapsed = Duration::ZERO;
        let mut scores = Vec::new();
        let mut best: Option<Candidate> = None;

        let stop_reason = loop {
            match self.store.record_call(session_id, &role.name) {
                Ok(_) => attempts += 1,
                Err(StoreError::Admission(AdmissionError::CallBudgetExceeded { calls, max })) if best.is_some() => {
                    info!(calls, max, "call budget exhausted during refinement");
                    break StopReason::CallBudgetExhausted;
                }
                Err(e) => return Err(e.into()),
            }

            let outcome = self.pipeline.run(&conversation, timeout, &mut tokens).await;
            elapsed += outcome.elapsed();
            let attempt_ms = outcome.elapsed().as_millis() as u64;

            let (result, stage, transport_failed) = match outcome {
                AttemptOutcome::Completed(done) => {
                    tool_rounds += done.tool_rounds;
                    conversation = done.conversation;
                    let normalized = self.normalizer.normalize(&done.final_text, &role.name).await;
                    let mut result = normalized.result;
                    result.metadata.elapsed_ms = attempt_ms;
                    (result, normalized.stage, false)
                }
                other => {
                    if let AttemptOutcome::TimedOut { tool_rounds: r, .. } | AttemptOutcome::ToolRoundsExceeded { rounds: r, .. } =
                        &other
                    {
                        tool_rounds += *r;
                    }
                    let reason = other.failure_reason().unwrap_or_default();
                    warn!(session_id = %session_id, attempt = attempts, outcome = other.as_str(), "attempt failed");
                    (
                        NormalizedResult::failed(&role.name, reason, attempt_ms),
                        ParseStage::Heuristic,
                        true,
                    )
                }
            };

            let assessment = self.validator.validate(
                &result,
                ValidationContext {
                    role: &role.name,
                    stage,
                },
            );
            let state = self
                .store
                .record_score(session_id, &role.name, &fingerprint, assessment.overall_score)?;
            scores = state.scores;
            info!(
                session_id = %session_id,
                attempt = attempts,
                stage = stage.as_str(),
                score = assessment.overall_score,
                passed = assessment.passed,
                trend = state.trend.as_str(),
                "attempt scored"
            );

            let decision = if transport_failed {
                None
            } else {
                Some(self.refinement.should_refine(&assessment, session_id, &role.name, &fingerprint)?)
            };

            let prompt = match decision {
                Some(RefinementDecision::Refine { .. }) => {
                    Some(self.refinement.build_refinement_prompt(&assessment, &req.task))
                }
                _ => None,
            };
            if best.as_ref().map_or(true, |b| assessment.overall_score > b.assessment.overall_score) {
                best = Some(Candidate {
                    result,
                    assessment,
                    stage,
                });
            }

            match decision {
                None => break StopReason::TransportFailure,
                Some(RefinementDecision::Stop(reason)) => break reason,
                Some(RefinementDecision::Refine { attempt }) => {
                    refinements = attempt;
                    if let Some(prompt) = prompt {
                        conversation.push(Message::user_text(prompt));
                    }
                }
            }
        };

        let Candidate {
            result,
            assessment,
            stage,
        } = best.ok_or_else(|| EngineError::Internal("no attempt produced a result".into()))?;

        let forwarded = self.forward_memory(session_id, &result).await;
        info!(
            session_id = %session_id,
            attempts,
            refinements,
            stop = stop_reason.as_str(),
            score = assessment.overall_score,
            "agent finished"
        );

        Ok(SpawnOutcome {
            usage: UsageMetadata {
                session_id: session_id.clone(),
                fingerprint,
                attempts,
                refinements,
                tool_rounds,
                tokens,
                elapsed_ms: elapsed.as_millis() as u64,
                parse_stage: stage,
                stop_reason,
                scores,
                compression_ratio: compressed.compression_ratio,
                context_warnings: compressed.warnings,
                memory_operations_forwarded: forwarded,
            },
            result,
            assessment,
        })
    }

    /// Submit the allow-listed memory operations of a non-failed result.
    async fn forward_memory(&self, session_id: &SessionId, result: &NormalizedResult) -> usize {
        let Some(sink) = &self.memory_sink else {
            return 0;
        };
        if result.status() == CompletionStatus::Failed {
            return 0;
        }
        let allow = &self.settings.quality.memory_operation_allow_list;
        let ops: Vec<MemoryOperation> = result
            .memory_operations
            .iter()
            .filter(|op| allow.iter().any(|a| *a == op.operation))
            .cloned()
            .collect();
        if ops.is_empty() {
            return 0;
        }
        match sink.submit(session_id, &ops).await {
            Ok(()) => ops.len(),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "memory sink rejected operations");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use tether_core::errors::GatewayError;
    use tether_core::memory::MemorySinkError;
    use tether_llm::{MockProvider, MockResponse};
    use tether_store::{SessionStatus, StoreLimits};

    use crate::roles::StaticRoleCatalog;

    const ROLE: &str = "backend-developer";

    fn good_json() -> String {
        let analysis = format!(
            "The request handler in src/api/orders.rs:88 holds the pool mutex while the query runs. {}",
            "The transaction in src/db/retry.rs wraps the retry loop and adds latency. ".repeat(12)
        );
        json!({
            "deliverables": {
                "analysis": analysis,
                "recommendations": [
                    "Release the pool mutex before awaiting the query",
                    "Move the retry loop outside the transaction scope"
                ],
                "artifacts": ["let rows = conn.query(sql).await?;\nrows.len()"]
            },
            "memory_operations": [
                {"operation": "add_observations", "payload": {"entity": "orders"}},
                {"operation": "drop_everything", "payload": {}}
            ],
            "metadata": {"completion_status": "complete", "confidence": "high"}
        })
        .to_string()
    }

    fn weak_json() -> String {
        json!({"analysis": "Too short.", "recommendations": ["fix"]}).to_string()
    }

    fn catalog() -> Arc<StaticRoleCatalog> {
        Arc::new(StaticRoleCatalog::new().with_role(RoleDefinition {
            name: ROLE.into(),
            system_prompt: "You are a backend developer.".into(),
            domain_keywords: vec!["latency".into()],
        }))
    }

    fn setup(dir: &std::path::Path, limits: StoreLimits, responses: Vec<MockResponse>) -> (Orchestrator, Arc<MockProvider>) {
        let store = Arc::new(SessionStore::open(dir, limits).unwrap());
        let provider = Arc::new(MockProvider::new(responses));
        let orch = Orchestrator::new(Arc::new(TetherSettings::default()), store, provider.clone(), catalog());
        (orch, provider)
    }

    fn request() -> SpawnRequest {
        SpawnRequest::new(ROLE, "Find why order creation is slow")
            .with_context("Order latency must stay under 200ms. The Order Service depends on the Ledger Store.")
            .with_deliverable_spec("Root cause and fixes.")
    }

    #[derive(Default)]
    struct RecordingSink {
        submitted: Mutex<Vec<MemoryOperation>>,
    }

    #[async_trait]
    impl MemorySink for RecordingSink {
        async fn submit(&self, _id: &SessionId, ops: &[MemoryOperation]) -> Result<(), MemorySinkError> {
            self.submitted.lock().extend_from_slice(ops);
            Ok(())
        }
    }

    #[tokio::test]
    async fn good_first_attempt_passes() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, provider) = setup(dir.path(), StoreLimits::default(), vec![MockResponse::text(&good_json())]);

        let out = orch.spawn_agent(request()).await.unwrap();
        assert!(out.assessment.passed, "{:?}", out.assessment);
        assert_eq!(out.usage.attempts, 1);
        assert_eq!(out.usage.refinements, 0);
        assert_eq!(out.usage.stop_reason, StopReason::Passed);
        assert_eq!(out.usage.parse_stage, ParseStage::Direct);
        assert_eq!(out.result.metadata.role, ROLE);
        assert_eq!(provider.call_count(), 1);

        let record = orch.store().get(&out.usage.session_id).unwrap();
        assert_eq!(record.status, SessionStatus::Completed);
        assert_eq!(record.total_calls, 1);
        assert!(orch.store().list_active().is_empty());

        // the compressed task reached the provider
        let first = provider.requests().remove(0);
        assert!(first[1].text().contains("Find why order creation is slow"));
        assert!(first[1].text().contains("Order latency must stay under 200ms"));
    }

    #[tokio::test]
    async fn weak_result_is_refined_in_same_conversation() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, provider) = setup(
            dir.path(),
            StoreLimits::default(),
            vec![MockResponse::text(&weak_json()), MockResponse::text(&good_json())],
        );

        let out = orch.spawn_agent(request()).await.unwrap();
        assert_eq!(out.usage.attempts, 2);
        assert_eq!(out.usage.refinements, 1);
        assert_eq!(out.usage.stop_reason, StopReason::Passed);
        assert_eq!(out.usage.scores.len(), 2);
        assert!(out.usage.scores[1] > out.usage.scores[0]);
        assert!(out.assessment.passed);

        let second = provider.last_request().unwrap();
        let roles: Vec<&str> = second.iter().map(Message::role_name).collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert!(second[3].text().contains("## Refinement Required"));
        assert!(second[3].text().contains("Find why order creation is slow"));

        let record = orch.store().get(&out.usage.session_id).unwrap();
        assert_eq!(record.total_calls, 2);
        assert_eq!(record.refinements_for(&out.usage.fingerprint), 1);
    }

    #[tokio::test]
    async fn best_attempt_retained_when_refinement_runs_out() {
        let dir = tempfile::tempdir().unwrap();
        let limits = StoreLimits {
            max_refinements: 1,
            ..Default::default()
        };
        // one path and nothing else: below threshold but better than the retry
        let better = json!({"analysis": "The slowdown lives in src/api/orders.rs."}).to_string();
        let worse = json!({"analysis": "Unclear."}).to_string();
        let (orch, _) = setup(
            dir.path(),
            limits,
            vec![MockResponse::text(&better), MockResponse::text(&worse)],
        );
        let out = orch.spawn_agent(request()).await.unwrap();
        assert_eq!(out.usage.attempts, 2);
        assert_eq!(out.usage.stop_reason, StopReason::BudgetExhausted);
        assert!(out.usage.scores[0] > out.usage.scores[1]);
        assert_eq!(out.assessment.overall_score, out.usage.scores[0]);
        assert!(out.result.deliverables.analysis.unwrap().contains("src/api/orders.rs"));
    }

    #[tokio::test]
    async fn unknown_role_creates_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, provider) = setup(dir.path(), StoreLimits::default(), vec![]);
        let err = orch.spawn_agent(SpawnRequest::new("poet", "write")).await.unwrap_err();
        assert!(matches!(err, EngineError::Role(_)));
        assert!(orch.store().list_active().is_empty());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn provider_error_returns_failed_result() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(
            dir.path(),
            StoreLimits::default(),
            vec![MockResponse::Error(GatewayError::NetworkError("reset".into()))],
        );
        let out = orch.spawn_agent(request()).await.unwrap();
        assert_eq!(out.result.status(), CompletionStatus::Failed);
        assert_eq!(out.result.metadata.confidence, tether_core::result::Confidence::Low);
        assert_eq!(out.usage.stop_reason, StopReason::TransportFailure);
        assert_eq!(out.usage.attempts, 1);
        assert!(!out.assessment.passed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_charged_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(
            dir.path(),
            StoreLimits::default(),
            vec![MockResponse::delayed(Duration::from_secs(600), MockResponse::text(&good_json()))],
        );
        let out = orch
            .spawn_agent(request().with_urgency(Urgency::Critical))
            .await
            .unwrap();
        assert_eq!(out.usage.stop_reason, StopReason::TransportFailure);
        assert!(out.result.deliverables.analysis.unwrap().contains("timed out"));
        assert_eq!(orch.store().get(&out.usage.session_id).unwrap().total_calls, 1);
    }

    #[tokio::test]
    async fn exhausted_call_budget_is_an_admission_error() {
        let dir = tempfile::tempdir().unwrap();
        let limits = StoreLimits {
            max_total_calls: 0,
            ..Default::default()
        };
        let (orch, provider) = setup(dir.path(), limits, vec![MockResponse::text(&good_json())]);
        let err = orch.spawn_agent(request()).await.unwrap_err();
        assert!(matches!(
            err.admission(),
            Some(AdmissionError::CallBudgetExceeded { .. })
        ));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn sub_agents_cannot_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(dir.path(), StoreLimits::default(), vec![]);
        let root = orch.begin_session(None).unwrap();
        let child = orch.begin_session(Some(&root)).unwrap();
        let err = orch.spawn_agent(request().with_parent(child)).await.unwrap_err();
        assert!(matches!(err.admission(), Some(AdmissionError::SubAgentCannotSpawn(_))));
    }

    #[tokio::test]
    async fn spawned_child_charges_parent() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(dir.path(), StoreLimits::default(), vec![MockResponse::text(&good_json())]);
        let root = orch.begin_session(None).unwrap();
        let out = orch.spawn_agent(request().with_parent(root.clone())).await.unwrap();
        let child = orch.store().get(&out.usage.session_id).unwrap();
        assert_eq!(child.depth, 1);
        assert_eq!(child.parent_id.as_ref(), Some(&root));
        assert_eq!(orch.store().get(&root).unwrap().total_calls, 1);
        orch.end_session(&root).unwrap();
    }

    #[tokio::test]
    async fn parallel_admission() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::open(dir.path(), StoreLimits::default()).unwrap());
        let provider = Arc::new(MockProvider::new(vec![]).with_fallback(MockResponse::text(&good_json())));
        let orch = Orchestrator::new(Arc::new(TetherSettings::default()), store, provider, catalog());
        let max = orch.store().limits().max_parallel_agents;

        let err = orch.spawn_parallel(vec![request(); max + 1]).await.unwrap_err();
        assert!(matches!(err.admission(), Some(AdmissionError::ParallelLimitExceeded { .. })));

        let results = orch.spawn_parallel(vec![request(); max]).await.unwrap();
        assert_eq!(results.len(), max);
        assert!(results.iter().all(|r| r.as_ref().is_ok_and(|o| o.assessment.passed)));
    }

    #[tokio::test]
    async fn allow_listed_memory_operations_forwarded() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(dir.path(), StoreLimits::default(), vec![MockResponse::text(&good_json())]);
        let sink = Arc::new(RecordingSink::default());
        let orch = orch.with_memory_sink(sink.clone());
        let out = orch.spawn_agent(request()).await.unwrap();
        assert_eq!(out.usage.memory_operations_forwarded, 1);
        let submitted = sink.submitted.lock();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].operation, "add_observations");
    }

    #[tokio::test]
    async fn metrics_wired_through_components() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = setup(dir.path(), StoreLimits::default(), vec![MockResponse::text(&good_json())]);
        let metrics = Arc::new(MetricsRecorder::new());
        let orch = orch.with_metrics(Arc::clone(&metrics));
        orch.spawn_agent(request()).await.unwrap();
        use tether_telemetry::metrics::names;
        assert_eq!(metrics.counter_get(names::NORMALIZER_STAGE, &[("stage", "direct")]), 1);
        assert_eq!(metrics.counter_get(names::PIPELINE_OUTCOME, &[("outcome", "completed")]), 1);
        assert_eq!(metrics.counter_get(names::REFINEMENT_DECISION, &[("decision", "passed")]), 1);
        assert_eq!(metrics.histogram_summary(names::QUALITY_SCORE, &[("role", ROLE)]).count, 1);
    }
}
