use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tether_core::fingerprint::TaskFingerprint;
use tether_core::ids::SessionId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
        }
    }
}

/// Persisted bookkeeping for one session in a lineage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub is_sub_agent: bool,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SessionId>,
    pub total_calls: u32,
    #[serde(default)]
    pub per_role_calls: BTreeMap<String, u32>,
    #[serde(default)]
    pub per_task_refinements: BTreeMap<TaskFingerprint, u32>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn root() -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            is_sub_agent: false,
            depth: 0,
            parent_id: None,
            total_calls: 0,
            per_role_calls: BTreeMap::new(),
            per_task_refinements: BTreeMap::new(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn child_of(parent: &SessionRecord) -> Self {
        Self {
            is_sub_agent: true,
            depth: parent.depth + 1,
            parent_id: Some(parent.id.clone()),
            ..Self::root()
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn refinements_for(&self, fingerprint: &TaskFingerprint) -> u32 {
        self.per_task_refinements.get(fingerprint).copied().unwrap_or(0)
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Declining => "declining",
            Self::Stable => "stable",
        }
    }
}

/// Score history for one (session, role, fingerprint) refinement lineage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RefinementState {
    pub session_id: SessionId,
    pub role: String,
    pub fingerprint: TaskFingerprint,
    pub attempts: u32,
    pub scores: Vec<f64>,
    pub last_attempt_at: DateTime<Utc>,
    pub trend: Trend,
}

impl RefinementState {
    pub fn new(session_id: SessionId, role: &str, fingerprint: TaskFingerprint) -> Self {
        Self {
            session_id,
            role: role.to_string(),
            fingerprint,
            attempts: 0,
            scores: Vec::new(),
            last_attempt_at: Utc::now(),
            trend: Trend::Stable,
        }
    }

    pub fn last_score(&self) -> Option<f64> {
        self.scores.last().copied()
    }

    pub fn best_score(&self) -> Option<f64> {
        self.scores.iter().copied().reduce(f64::max)
    }
}

/// Classify the last `window` scores.
///
/// `Declining` needs a full window where every step drops by at least
/// `delta`; `Improving` needs every step in the window to rise by at least
/// `delta`. Anything else, including fewer than two scores, is `Stable`.
pub fn classify_trend(scores: &[f64], window: usize, delta: f64) -> Trend {
    if scores.len() < 2 {
        return Trend::Stable;
    }
    let window = window.max(2);
    let tail = &scores[scores.len().saturating_sub(window)..];
    let steps: Vec<f64> = tail.windows(2).map(|w| w[1] - w[0]).collect();

    if tail.len() == window && steps.iter().all(|d| *d <= -delta) {
        Trend::Declining
    } else if steps.iter().all(|d| *d >= delta) {
        Trend::Improving
    } else {
        Trend::Stable
    }
}
