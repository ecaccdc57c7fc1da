use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Important,
    Minor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Structure,
    Completeness,
    MemoryOperations,
    Coherence,
    Depth,
    Specificity,
    CodeEvidence,
    Concreteness,
}

impl RuleCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Structure => "structure",
            Self::Completeness => "completeness",
            Self::MemoryOperations => "memory_operations",
            Self::Coherence => "coherence",
            Self::Depth => "depth",
            Self::Specificity => "specificity",
            Self::CodeEvidence => "code_evidence",
            Self::Concreteness => "concreteness",
        }
    }
}

/// Independent judgement of one rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleResult {
    pub rule: String,
    pub category: RuleCategory,
    pub passed: bool,
    pub score: f64,
    pub severity: Severity,
    pub weight: f64,
    pub feedback: String,
}

impl RuleResult {
    pub fn is_critical_failure(&self) -> bool {
        !self.passed && self.severity == Severity::Critical
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub overall_score: f64,
    pub threshold: f64,
    pub passed: bool,
    pub rule_results: Vec<RuleResult>,
    pub category_scores: BTreeMap<RuleCategory, f64>,
    /// Names of rules that failed with critical severity.
    pub critical_failures: Vec<String>,
    /// Whether another attempt could plausibly fix the failures.
    pub refinement_feasible: bool,
    pub suggestions: Vec<String>,
}

impl QualityAssessment {
    pub fn has_critical_failure(&self) -> bool {
        !self.critical_failures.is_empty()
    }

    /// Categories scoring under the pass threshold, lowest first.
    pub fn under_threshold_categories(&self) -> Vec<(RuleCategory, f64)> {
        let mut under: Vec<(RuleCategory, f64)> = self
            .category_scores
            .iter()
            .filter(|(_, score)| **score < self.threshold)
            .map(|(c, s)| (*c, *s))
            .collect();
        under.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        under
    }

    /// Feedback from failed rules that are not critical.
    pub fn fixable_feedback(&self) -> Vec<&str> {
        self.rule_results
            .iter()
            .filter(|r| !r.passed && r.severity != Severity::Critical)
            .map(|r| r.feedback.as_str())
            .collect()
    }
}
