use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Complete,
    Partial,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Which normalizer stage produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseStage {
    Direct,
    Repaired,
    Corrected,
    Heuristic,
}

impl ParseStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Repaired => "repaired",
            Self::Corrected => "corrected",
            Self::Heuristic => "heuristic",
        }
    }

    /// True when the provider's output was structured data of some form.
    pub fn is_structured(self) -> bool {
        !matches!(self, Self::Heuristic)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Deliverables {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
}

impl Deliverables {
    pub fn is_empty(&self) -> bool {
        self.analysis.as_deref().is_none_or(|a| a.trim().is_empty())
            && self.recommendations.is_empty()
            && self.artifacts.is_empty()
    }

    /// All free text in the deliverables, for content heuristics.
    pub fn combined_text(&self) -> String {
        let mut out = self.analysis.clone().unwrap_or_default();
        for r in &self.recommendations {
            out.push('\n');
            out.push_str(r);
        }
        for a in &self.artifacts {
            out.push('\n');
            match a {
                serde_json::Value::String(s) => out.push_str(s),
                other => out.push_str(&other.to_string()),
            }
        }
        out
    }
}

/// A proposed knowledge side-effect. The payload is never interpreted here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryOperation {
    pub operation: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub role: String,
    pub completion_status: CompletionStatus,
    #[serde(default)]
    pub elapsed_ms: u64,
    pub confidence: Confidence,
}

/// Structured output of one invocation attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub deliverables: Deliverables,
    #[serde(default)]
    pub memory_operations: Vec<MemoryOperation>,
    pub metadata: ResultMetadata,
}

impl NormalizedResult {
    /// Well-formed failure shape used for transport errors and timeouts.
    pub fn failed(role: impl Into<String>, reason: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            deliverables: Deliverables {
                analysis: Some(reason.into()),
                ..Default::default()
            },
            memory_operations: Vec::new(),
            metadata: ResultMetadata {
                role: role.into(),
                completion_status: CompletionStatus::Failed,
                elapsed_ms,
                confidence: Confidence::Low,
            },
        }
    }

    pub fn status(&self) -> CompletionStatus {
        self.metadata.completion_status
    }
}
