//! Refinement Controller: the bounded refine-until-good-enough loop.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use tether_core::fingerprint::TaskFingerprint;
use tether_core::ids::SessionId;
use tether_core::quality::QualityAssessment;
use tether_settings::RefinementSettings;
use tether_store::{AdmissionError, SessionStore, StoreError, Trend};
use tether_telemetry::metrics::{names, MetricsRecorder};

/// Why the loop stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Passed,
    CriticalFailure,
    Declining,
    MaxAttempts,
    /// The session's refinement ceiling was reached.
    BudgetExhausted,
    /// The lineage call budget ran out before the next attempt.
    CallBudgetExhausted,
    /// Timeout or provider error; retry belongs to the caller.
    TransportFailure,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::CriticalFailure => "critical_failure",
            Self::Declining => "declining",
            Self::MaxAttempts => "max_attempts",
            Self::BudgetExhausted => "budget_exhausted",
            Self::CallBudgetExhausted => "call_budget_exhausted",
            Self::TransportFailure => "transport_failure",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefinementDecision {
    /// Run refinement number `attempt` (1-based); already recorded.
    Refine { attempt: u32 },
    Stop(StopReason),
}

pub struct RefinementController {
    settings: RefinementSettings,
    store: Arc<SessionStore>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl RefinementController {
    pub fn new(settings: RefinementSettings, store: Arc<SessionStore>) -> Self {
        Self {
            settings,
            store,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether to re-invoke after `assessment`.
    ///
    /// Checks run in order: passed, critical failure, declining trend, the
    /// role's attempt ceiling, then the store's refinement budget. A `Refine`
    /// decision has already been charged via `record_refinement`.
    pub fn should_refine(
        &self,
        assessment: &QualityAssessment,
        session: &SessionId,
        role: &str,
        fingerprint: &TaskFingerprint,
    ) -> Result<RefinementDecision, StoreError> {
        let decision = self.decide(assessment, session, role, fingerprint)?;
        let label = match decision {
            RefinementDecision::Refine { .. } => "refine",
            RefinementDecision::Stop(reason) => reason.as_str(),
        };
        debug!(session_id = %session, role, fingerprint = fingerprint.short(), decision = label, "refinement decision");
        if let Some(m) = &self.metrics {
            m.counter_inc(names::REFINEMENT_DECISION, &[("decision", label)], 1);
        }
        Ok(decision)
    }

    fn decide(
        &self,
        assessment: &QualityAssessment,
        session: &SessionId,
        role: &str,
        fingerprint: &TaskFingerprint,
    ) -> Result<RefinementDecision, StoreError> {
        use RefinementDecision::{Refine, Stop};

        if assessment.passed {
            return Ok(Stop(StopReason::Passed));
        }
        if assessment.has_critical_failure() {
            return Ok(Stop(StopReason::CriticalFailure));
        }
        if self.settings.stop_on_decline {
            let trend = self
                .store
                .refinement_state(session, role, fingerprint)
                .map(|s| s.trend);
            if trend == Some(Trend::Declining) {
                info!(session_id = %session, role, "quality declining, stopping refinement");
                return Ok(Stop(StopReason::Declining));
            }
        }

        let used = self.store.refinement_count(session, fingerprint)?;
        if used >= self.settings.max_attempts_for(role) {
            return Ok(Stop(StopReason::MaxAttempts));
        }

        match self.store.record_refinement(session, fingerprint) {
            Ok(attempt) => Ok(Refine { attempt }),
            Err(StoreError::Admission(AdmissionError::RefinementBudgetExceeded { .. })) => {
                Ok(Stop(StopReason::BudgetExhausted))
            }
            Err(e) => Err(e),
        }
    }

    /// Corrective user turn for the next attempt.
    pub fn build_refinement_prompt(&self, assessment: &QualityAssessment, task: &str) -> String {
        build_refinement_prompt(assessment, task)
    }
}

/// Previous score and threshold, under-threshold categories, feedback from
/// non-critical failures, then the original task.
pub fn build_refinement_prompt(assessment: &QualityAssessment, task: &str) -> String {
    let mut out = format!(
        "## Refinement Required\nYour previous response scored {:.1} against a threshold of {:.1}.\n",
        assessment.overall_score, assessment.threshold
    );

    let under = assessment.under_threshold_categories();
    if !under.is_empty() {
        out.push_str("\n### Weak Areas\n");
        for (category, score) in under {
            out.push_str(&format!("- {}: {:.1}\n", category.as_str(), score));
        }
    }

    let feedback = assessment.fixable_feedback();
    if !feedback.is_empty() {
        out.push_str("\n### Feedback\n");
        for f in feedback.into_iter().filter(|f| !f.is_empty()) {
            out.push_str("- ");
            out.push_str(f);
            out.push('\n');
        }
    }

    out.push_str("\n### Original Task\n");
    out.push_str(task);
    out.push_str("\n\nReturn a complete, corrected response in the same JSON format.");
    out
}
