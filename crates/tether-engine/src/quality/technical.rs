//! Rules for roles in the configured technical set.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use tether_core::quality::{RuleCategory, RuleResult, Severity};
use tether_core::result::NormalizedResult;

use super::rules::judgement;

pub const PATH_SPECIFICITY: &str = "path_specificity";
pub const CODE_EVIDENCE: &str = "code_evidence";
pub const ANALYSIS_CONCRETENESS: &str = "analysis_concreteness";

static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:[\w.\-]+/)*[\w\-]+\.(?:rs|go|ts|tsx|js|jsx|py|java|kt|rb|c|h|cc|cpp|hpp|cs|swift|toml|yaml|yml|json|sql|sh|proto|md)(?::\d+)?\b",
    )
    .unwrap()
});

static CODE_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```[\s\S]*?```|`[^`\n]{3,}`").unwrap());

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)your[_ ]code[_ ]here|<placeholder>|implement(?:ation)? here|\bTODO\b|//\s*\.\.\.|#\s*\.\.\.|\.\.\.\s*rest of")
        .unwrap()
});

static TECHNICAL_TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(function|method|struct|enum|trait|interface|module|crate|package|endpoint|handler|query|index|schema|migration|transaction|mutex|lock|thread|async|channel|queue|cache|buffer|allocation|latency|throughput|timeout|retry|config|dependency|api|request|response|stack trace|null pointer|race condition|deadlock)\b|\b\d+(?:\.\d+)?\s?(?:ms|s|kb|mb|gb|%)\b",
    )
    .unwrap()
});

static HEDGE_TERM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(maybe|perhaps|might|possibly|probably|could be|seems|appears to|somewhat|generally|various|etc|some kind of|it depends|not sure|kind of|sort of)\b",
    )
    .unwrap()
});

pub fn path_specificity(result: &NormalizedResult) -> RuleResult {
    let text = result.deliverables.combined_text();
    let paths: HashSet<&str> = FILE_PATH.find_iter(&text).map(|m| m.as_str()).collect();
    let score = match paths.len() {
        0 => 0.0,
        1 => 60.0,
        2 => 80.0,
        _ => 100.0,
    };
    let feedback = if paths.is_empty() {
        "Reference the specific files (with line numbers where possible) the findings apply to.".to_string()
    } else {
        String::new()
    };
    judgement(
        PATH_SPECIFICITY,
        RuleCategory::Specificity,
        Severity::Important,
        score,
        score >= 60.0,
        feedback,
    )
}

pub fn code_evidence(result: &NormalizedResult) -> RuleResult {
    let text = result.deliverables.combined_text();
    let spans: Vec<&str> = CODE_SPAN.find_iter(&text).map(|m| m.as_str()).collect();
    let has_code_artifact = result
        .deliverables
        .artifacts
        .iter()
        .any(|a| a.as_str().is_some_and(|s| s.contains('\n') || s.contains(';')) || a.get("code").is_some());

    let placeholders = PLACEHOLDER.find_iter(&text).count();
    let base: f64 = if spans.is_empty() && !has_code_artifact { 0.0 } else { 100.0 };
    let score = base - 30.0 * placeholders as f64;

    let feedback = if base == 0.0 {
        "Include literal code fragments that show the problem or the fix.".to_string()
    } else if placeholders > 0 {
        format!("Replace {placeholders} placeholder(s) with real code.")
    } else {
        String::new()
    };
    judgement(
        CODE_EVIDENCE,
        RuleCategory::CodeEvidence,
        Severity::Important,
        score,
        score >= 60.0,
        feedback,
    )
}

pub fn analysis_concreteness(result: &NormalizedResult) -> RuleResult {
    let text = result.deliverables.combined_text();
    let technical = TECHNICAL_TERM.find_iter(&text).count();
    let hedges = HEDGE_TERM.find_iter(&text).count();
    let score = if technical + hedges == 0 {
        40.0
    } else {
        100.0 * technical as f64 / (technical + hedges) as f64
    };
    let feedback = if score >= 60.0 {
        String::new()
    } else {
        format!("Analysis is vague ({technical} technical terms, {hedges} hedges); name the components and mechanisms involved.")
    };
    judgement(
        ANALYSIS_CONCRETENESS,
        RuleCategory::Concreteness,
        Severity::Minor,
        score,
        score >= 60.0,
        feedback,
    )
}
