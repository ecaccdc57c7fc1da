//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and implement
//! [`Default`] with production values. Every section is `#[serde(default)]`
//! so partial JSON fills the rest from defaults.

mod context;
mod pipeline;
mod quality;
mod sessions;

pub use context::*;
pub use pipeline::*;
pub use quality::*;
pub use sessions::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "sessions": { "maxDepth": 1 },
///   "quality": { "defaultThreshold": 75 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Admission ceilings and persistence root.
    pub sessions: SessionSettings,
    /// Context compression and history pruning.
    pub context: ContextSettings,
    /// Provider call loop.
    pub pipeline: PipelineSettings,
    /// Response normalization.
    pub normalizer: NormalizerSettings,
    /// Rule thresholds and allow-lists.
    pub quality: QualitySettings,
    /// Refinement loop bounds.
    pub refinement: RefinementSettings,
    /// Provider retry and circuit breaker.
    pub retry: RetrySettings,
    pub logging: LoggingSettings,
}

/// Retry configuration for provider calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter factor (0.0–1.0) applied to retry delays.
    pub jitter_factor: f64,
    /// Consecutive failures that open the circuit.
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level; `RUST_LOG` takes precedence.
    pub level: String,
    /// JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}
