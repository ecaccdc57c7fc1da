//! Universal rules, applied to every role.

use tether_core::quality::{RuleCategory, RuleResult, Severity};
use tether_core::result::{CompletionStatus, Confidence, NormalizedResult, ParseStage};

pub const STRUCTURE_FORMAT: &str = "structure_format";
pub const DELIVERABLES_COMPLETENESS: &str = "deliverables_completeness";
pub const MEMORY_OPERATIONS_VALID: &str = "memory_operations_valid";
pub const STATUS_COHERENCE: &str = "status_coherence";
pub const CONTENT_DEPTH: &str = "content_depth";

/// Build a rule result; `weight` is filled in by the validator.
pub(crate) fn judgement(
    rule: &str,
    category: RuleCategory,
    severity: Severity,
    score: f64,
    passed: bool,
    feedback: impl Into<String>,
) -> RuleResult {
    RuleResult {
        rule: rule.to_string(),
        category,
        passed,
        score: score.clamp(0.0, 100.0),
        severity,
        weight: 1.0,
        feedback: feedback.into(),
    }
}

pub(crate) fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

pub fn structure_format(stage: ParseStage) -> RuleResult {
    let (score, feedback) = match stage {
        ParseStage::Direct => (100.0, ""),
        ParseStage::Repaired => (85.0, "Response JSON needed repair; return one complete JSON object without fences."),
        ParseStage::Corrected => (70.0, "Response JSON was unreadable until corrected; follow the response format exactly."),
        ParseStage::Heuristic => (
            10.0,
            "Response was not a JSON object; reply with the deliverables, memory_operations and metadata object.",
        ),
    };
    judgement(
        STRUCTURE_FORMAT,
        RuleCategory::Structure,
        Severity::Critical,
        score,
        stage.is_structured(),
        feedback,
    )
}

pub fn deliverables_completeness(result: &NormalizedResult) -> RuleResult {
    let d = &result.deliverables;
    let has_analysis = d.analysis.as_deref().is_some_and(|a| !a.trim().is_empty());
    let has_recs = !d.recommendations.is_empty();
    let has_artifacts = !d.artifacts.is_empty();

    if d.is_empty() {
        return judgement(
            DELIVERABLES_COMPLETENESS,
            RuleCategory::Completeness,
            Severity::Critical,
            0.0,
            false,
            "No deliverables were produced.",
        );
    }

    let score = match (has_analysis, has_recs) {
        (true, true) => 100.0,
        (true, false) | (false, true) if has_artifacts => 75.0,
        _ => 55.0,
    };
    let mut missing = Vec::new();
    if !has_analysis {
        missing.push("an analysis");
    }
    if !has_recs {
        missing.push("concrete recommendations");
    }
    let feedback = if missing.is_empty() {
        String::new()
    } else {
        format!("Deliverables are missing {}.", missing.join(" and "))
    };
    judgement(
        DELIVERABLES_COMPLETENESS,
        RuleCategory::Completeness,
        Severity::Important,
        score,
        score >= 75.0,
        feedback,
    )
}

pub fn memory_operations_valid(result: &NormalizedResult, allow_list: &[String]) -> RuleResult {
    let ops = &result.memory_operations;
    if ops.is_empty() {
        return judgement(
            MEMORY_OPERATIONS_VALID,
            RuleCategory::MemoryOperations,
            Severity::Important,
            100.0,
            true,
            "",
        );
    }
    let invalid: Vec<&str> = ops
        .iter()
        .map(|op| op.operation.as_str())
        .filter(|name| !allow_list.iter().any(|a| a == name))
        .collect();
    let score = 100.0 * (ops.len() - invalid.len()) as f64 / ops.len() as f64;
    let feedback = if invalid.is_empty() {
        String::new()
    } else {
        format!(
            "Unknown memory operations: {}. Allowed: {}.",
            invalid.join(", "),
            allow_list.join(", ")
        )
    };
    judgement(
        MEMORY_OPERATIONS_VALID,
        RuleCategory::MemoryOperations,
        Severity::Important,
        score,
        invalid.is_empty(),
        feedback,
    )
}

pub fn status_coherence(result: &NormalizedResult) -> RuleResult {
    let status = result.metadata.completion_status;
    let confidence = result.metadata.confidence;
    let mut score: f64 = 100.0;
    let mut problems = Vec::new();

    match (status, confidence) {
        (CompletionStatus::Complete, Confidence::Low) => {
            score -= 40.0;
            problems.push("status is complete but confidence is low");
        }
        (CompletionStatus::Failed, Confidence::High) => {
            score -= 50.0;
            problems.push("status is failed but confidence is high");
        }
        _ => {}
    }
    if status == CompletionStatus::Complete && result.deliverables.recommendations.is_empty() {
        score -= 30.0;
        problems.push("status is complete but there are no recommendations");
    }

    let feedback = if problems.is_empty() {
        String::new()
    } else {
        format!("Metadata is inconsistent: {}.", problems.join("; "))
    };
    judgement(
        STATUS_COHERENCE,
        RuleCategory::Coherence,
        Severity::Important,
        score,
        problems.is_empty(),
        feedback,
    )
}

pub fn content_depth(result: &NormalizedResult) -> RuleResult {
    let d = &result.deliverables;
    let words = d.analysis.as_deref().map_or(0, word_count);
    let analysis_score = match words {
        120.. => 100.0,
        50..=119 => 75.0,
        20..=49 => 50.0,
        1..=19 => 25.0,
        0 => 0.0,
    };
    let recs_score = if d.recommendations.is_empty() {
        0.0
    } else {
        let avg = d.recommendations.iter().map(|r| word_count(r)).sum::<usize>() as f64
            / d.recommendations.len() as f64;
        if avg >= 6.0 {
            100.0
        } else if avg >= 3.0 {
            60.0
        } else {
            30.0
        }
    };
    let score = 0.7 * analysis_score + 0.3 * recs_score;
    let feedback = if score >= 50.0 {
        String::new()
    } else {
        format!("Analysis is thin ({words} words); explain findings and reasoning in more depth.")
    };
    judgement(
        CONTENT_DEPTH,
        RuleCategory::Depth,
        Severity::Minor,
        score,
        score >= 50.0,
        feedback,
    )
}
