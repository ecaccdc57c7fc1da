//! Invocation pipeline and response normalizer settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::role::Urgency;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSettings {
    pub max_tokens: u32,
    pub temperature: f64,
    /// Cap on provider/tool round-trips per attempt. `null` disables the cap.
    pub max_tool_rounds: Option<u32>,
    pub urgency_timeouts_secs: UrgencyTimeouts,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_tokens: 4096,
            temperature: 0.2,
            max_tool_rounds: Some(25),
            urgency_timeouts_secs: UrgencyTimeouts::default(),
        }
    }
}

/// Attempt deadline per urgency level, in seconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UrgencyTimeouts {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

impl Default for UrgencyTimeouts {
    fn default() -> Self {
        Self {
            critical: Urgency::Critical.default_timeout().as_secs(),
            high: Urgency::High.default_timeout().as_secs(),
            medium: Urgency::Medium.default_timeout().as_secs(),
            low: Urgency::Low.default_timeout().as_secs(),
        }
    }
}

impl UrgencyTimeouts {
    pub fn timeout_for(&self, urgency: Urgency) -> Duration {
        let secs = match urgency {
            Urgency::Critical => self.critical,
            Urgency::High => self.high,
            Urgency::Medium => self.medium,
            Urgency::Low => self.low,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NormalizerSettings {
    /// Corrector round-trips tried before falling back to heuristics.
    pub max_correction_attempts: u32,
    /// Recommendations kept by the heuristic fallback.
    pub fallback_recommendation_cap: usize,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            max_correction_attempts: 2,
            fallback_recommendation_cap: 5,
        }
    }
}
