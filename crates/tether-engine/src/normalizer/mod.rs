//! Response Normalizer: raw provider text to a [`NormalizedResult`].
//!
//! Stages run in order until one yields a result with at least one
//! non-empty deliverable: direct parse, repaired parse, external
//! correction, heuristic fallback. The last stage cannot fail, so
//! [`ResponseNormalizer::normalize`] is total.

pub mod corrector;
pub mod heuristic;
pub mod repair;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use tether_core::result::{
    CompletionStatus, Confidence, Deliverables, MemoryOperation, NormalizedResult, ParseStage, ResultMetadata,
};
use tether_settings::NormalizerSettings;
use tether_telemetry::metrics::{names, MetricsRecorder};

pub use corrector::{Corrector, ProviderCorrector};

/// A normalized result and the stage that produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    pub result: NormalizedResult,
    pub stage: ParseStage,
}

pub struct ResponseNormalizer {
    settings: NormalizerSettings,
    corrector: Option<Arc<dyn Corrector>>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl ResponseNormalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        Self {
            settings,
            corrector: None,
            metrics: None,
        }
    }

    pub fn with_corrector(mut self, corrector: Arc<dyn Corrector>) -> Self {
        self.corrector = Some(corrector);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run every stage, including external correction when configured.
    pub async fn normalize(&self, raw: &str, role: &str) -> Normalized {
        if let Some(done) = parse_local(raw, role) {
            return self.finish(done, role);
        }

        if let Some(corrector) = &self.corrector {
            let mut malformed = raw.to_string();
            for attempt in 1..=self.settings.max_correction_attempts {
                let corrected = AssertUnwindSafe(corrector.correct(&malformed, role))
                    .catch_unwind()
                    .await;
                let text = match corrected {
                    Ok(Some(text)) => text,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(role, attempt, "corrector panicked");
                        break;
                    }
                };
                if let Some(result) = parse_structured(&text, role) {
                    return self.finish(
                        Normalized {
                            result,
                            stage: ParseStage::Corrected,
                        },
                        role,
                    );
                }
                debug!(role, attempt, "corrected output still unparseable");
                malformed = text;
            }
        }

        self.finish(self.heuristic(raw, role), role)
    }

    /// Direct, repaired and heuristic stages only. Never suspends.
    pub fn normalize_offline(&self, raw: &str, role: &str) -> Normalized {
        let done = parse_local(raw, role).unwrap_or_else(|| self.heuristic(raw, role));
        self.finish(done, role)
    }

    fn heuristic(&self, raw: &str, role: &str) -> Normalized {
        Normalized {
            result: heuristic::fallback(raw, role, self.settings.fallback_recommendation_cap),
            stage: ParseStage::Heuristic,
        }
    }

    fn finish(&self, done: Normalized, role: &str) -> Normalized {
        debug!(role, stage = done.stage.as_str(), "response normalized");
        if let Some(m) = &self.metrics {
            m.counter_inc(names::NORMALIZER_STAGE, &[("stage", done.stage.as_str())], 1);
        }
        done
    }
}

fn parse_local(raw: &str, role: &str) -> Option<Normalized> {
    if let Some(result) = repair::direct_candidate(raw).and_then(|c| parse_candidate(c, role)) {
        return Some(Normalized {
            result,
            stage: ParseStage::Direct,
        });
    }
    let repaired = repair::repair(raw)?;
    parse_candidate(&repaired, role).map(|result| Normalized {
        result,
        stage: ParseStage::Repaired,
    })
}

/// Direct then repaired parse of text returned by a corrector.
fn parse_structured(text: &str, role: &str) -> Option<NormalizedResult> {
    parse_local(text, role).map(|n| n.result)
}

fn parse_candidate(candidate: &str, role: &str) -> Option<NormalizedResult> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    from_value(&value, role)
}

/// Tolerant mapping from parsed JSON to a result.
///
/// Deliverable fields may sit under `deliverables` or at the top level.
/// Recommendations may be strings or objects. Missing metadata defaults to
/// complete/medium. Returns `None` when every deliverable is empty.
pub fn from_value(value: &Value, role: &str) -> Option<NormalizedResult> {
    let root = value.as_object()?;
    let source = root.get("deliverables").and_then(Value::as_object).unwrap_or(root);

    let deliverables = Deliverables {
        analysis: ["analysis", "summary", "findings"]
            .iter()
            .find_map(|k| source.get(*k).and_then(text_of))
            .filter(|s| !s.trim().is_empty()),
        recommendations: source
            .get("recommendations")
            .map(recommendations_of)
            .unwrap_or_default(),
        artifacts: match source.get("artifacts") {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Null) | None => Vec::new(),
            Some(other) => vec![other.clone()],
        },
    };
    if deliverables.is_empty() {
        return None;
    }

    let memory_operations = match root.get("memory_operations") {
        Some(Value::Array(ops)) => ops.iter().filter_map(memory_operation_of).collect(),
        _ => Vec::new(),
    };

    let meta = root.get("metadata").and_then(Value::as_object);
    let field = |key: &str| meta.and_then(|m| m.get(key)).and_then(Value::as_str);

    Some(NormalizedResult {
        deliverables,
        memory_operations,
        metadata: ResultMetadata {
            role: role.to_string(),
            completion_status: field("completion_status")
                .or_else(|| field("status"))
                .and_then(parse_status)
                .unwrap_or(CompletionStatus::Complete),
            elapsed_ms: meta
                .and_then(|m| m.get("elapsed_ms"))
                .and_then(Value::as_u64)
                .unwrap_or(0),
            confidence: field("confidence")
                .and_then(parse_confidence)
                .unwrap_or(Confidence::Medium),
        },
    })
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(text_of).collect();
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        other => Some(other.to_string()),
    }
}

fn recommendations_of(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.as_slice(),
        Value::String(s) if !s.trim().is_empty() => return vec![s.clone()],
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => ["description", "recommendation", "text", "title", "action"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .map(str::to_string)
                .or_else(|| Some(item.to_string())),
            Value::Null => None,
            other => Some(other.to_string()),
        })
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn memory_operation_of(value: &Value) -> Option<MemoryOperation> {
    match value {
        Value::String(name) => Some(MemoryOperation {
            operation: name.clone(),
            payload: Value::Null,
        }),
        Value::Object(obj) => {
            let name = ["operation", "type", "op"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))?;
            let payload = obj.get("payload").cloned().unwrap_or_else(|| {
                let rest: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "operation" | "type" | "op"))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Value::Object(rest)
            });
            Some(MemoryOperation {
                operation: name.to_string(),
                payload,
            })
        }
        _ => None,
    }
}

fn parse_status(s: &str) -> Option<CompletionStatus> {
    match s.trim().to_ascii_lowercase().as_str() {
        "complete" | "completed" | "success" | "done" => Some(CompletionStatus::Complete),
        "partial" | "incomplete" | "in_progress" => Some(CompletionStatus::Partial),
        "failed" | "failure" | "error" => Some(CompletionStatus::Failed),
        _ => None,
    }
}

fn parse_confidence(s: &str) -> Option<Confidence> {
    match s.trim().to_ascii_lowercase().as_str() {
        "high" => Some(Confidence::High),
        "medium" | "moderate" => Some(Confidence::Medium),
        "low" => Some(Confidence::Low),
        _ => None,
    }
}
