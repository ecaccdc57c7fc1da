//! Quality Validator: deterministic, rule-weighted scoring of a result.
//!
//! Universal rules always apply; technical rules apply only to roles in
//! the configured technical set. The overall score is normalized by the
//! weights of the rules that actually ran.

pub mod rules;
pub mod technical;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use tether_core::quality::{QualityAssessment, RuleCategory, RuleResult, Severity};
use tether_core::result::{NormalizedResult, ParseStage};
use tether_settings::QualitySettings;
use tether_telemetry::metrics::{names, MetricsRecorder};

/// What the validator knows about the attempt besides the result itself.
#[derive(Clone, Copy, Debug)]
pub struct ValidationContext<'a> {
    pub role: &'a str,
    pub stage: ParseStage,
}

fn default_weight(rule: &str) -> f64 {
    match rule {
        rules::STRUCTURE_FORMAT | rules::DELIVERABLES_COMPLETENESS => 1.5,
        rules::CONTENT_DEPTH | technical::ANALYSIS_CONCRETENESS => 0.75,
        _ => 1.0,
    }
}

pub struct QualityValidator {
    settings: QualitySettings,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl QualityValidator {
    pub fn new(settings: QualitySettings) -> Self {
        Self { settings, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &QualitySettings {
        &self.settings
    }

    pub fn validate(&self, result: &NormalizedResult, ctx: ValidationContext<'_>) -> QualityAssessment {
        let mut results = vec![
            rules::structure_format(ctx.stage),
            rules::deliverables_completeness(result),
            rules::memory_operations_valid(result, &self.settings.memory_operation_allow_list),
            rules::status_coherence(result),
            rules::content_depth(result),
        ];
        if self.settings.is_technical(ctx.role) {
            results.push(technical::path_specificity(result));
            results.push(technical::code_evidence(result));
            results.push(technical::analysis_concreteness(result));
        }
        for r in &mut results {
            r.weight = self
                .settings
                .rule_weights
                .get(&r.rule)
                .copied()
                .unwrap_or_else(|| default_weight(&r.rule))
                .max(0.0);
        }

        let overall_score = weighted_mean(results.iter());
        let threshold = self.settings.threshold_for(ctx.role);
        let passed = overall_score >= threshold;

        let mut by_category: BTreeMap<RuleCategory, Vec<&RuleResult>> = BTreeMap::new();
        for r in &results {
            by_category.entry(r.category).or_default().push(r);
        }
        let category_scores = by_category
            .into_iter()
            .map(|(category, rs)| (category, weighted_mean(rs.into_iter())))
            .collect();

        let critical_failures: Vec<String> = results
            .iter()
            .filter(|r| r.is_critical_failure())
            .map(|r| r.rule.clone())
            .collect();
        let refinement_feasible =
            !passed && critical_failures.is_empty() && results.iter().any(|r| !r.passed);

        let mut failing: Vec<&RuleResult> = results.iter().filter(|r| !r.passed && !r.feedback.is_empty()).collect();
        failing.sort_by(|a, b| {
            severity_rank(a.severity)
                .cmp(&severity_rank(b.severity))
                .then(a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
        });
        let suggestions = failing.iter().map(|r| r.feedback.clone()).collect();

        debug!(
            role = ctx.role,
            stage = ctx.stage.as_str(),
            score = overall_score,
            threshold,
            passed,
            rules = results.len(),
            "result validated"
        );
        if let Some(m) = &self.metrics {
            m.histogram_observe(names::QUALITY_SCORE, &[("role", ctx.role)], overall_score);
        }

        QualityAssessment {
            overall_score,
            threshold,
            passed,
            rule_results: results,
            category_scores,
            critical_failures,
            refinement_feasible,
            suggestions,
        }
    }
}

fn weighted_mean<'a>(results: impl Iterator<Item = &'a RuleResult>) -> f64 {
    let (sum, weights) = results.fold((0.0, 0.0), |(s, w), r| (s + r.score * r.weight, w + r.weight));
    if weights > 0.0 {
        sum / weights
    } else {
        0.0
    }
}

fn severity_rank(s: Severity) -> u8 {
    match s {
        Severity::Critical => 0,
        Severity::Important => 1,
        Severity::Minor => 2,
    }
}
