//! Quality validator and refinement controller settings.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Memory operation names a result may propose.
pub const DEFAULT_MEMORY_OPERATIONS: &[&str] = &[
    "create_entities",
    "create_relations",
    "add_observations",
    "delete_entities",
    "delete_observations",
    "delete_relations",
];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualitySettings {
    pub default_threshold: f64,
    /// Per-role pass thresholds, stricter for higher-stakes roles.
    pub role_thresholds: BTreeMap<String, f64>,
    /// Roles that additionally get the technical rule set.
    pub technical_roles: Vec<String>,
    pub memory_operation_allow_list: Vec<String>,
    /// Per-rule weight overrides, keyed by rule name.
    pub rule_weights: BTreeMap<String, f64>,
}

impl Default for QualitySettings {
    fn default() -> Self {
        Self {
            default_threshold: 70.0,
            role_thresholds: BTreeMap::from([
                ("security-auditor".to_string(), 85.0),
                ("architect".to_string(), 80.0),
            ]),
            technical_roles: [
                "architect",
                "backend-developer",
                "frontend-developer",
                "code-reviewer",
                "security-auditor",
                "debugger",
                "devops-engineer",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            memory_operation_allow_list: DEFAULT_MEMORY_OPERATIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rule_weights: BTreeMap::new(),
        }
    }
}

impl QualitySettings {
    pub fn threshold_for(&self, role: &str) -> f64 {
        self.role_thresholds
            .get(role)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn is_technical(&self, role: &str) -> bool {
        self.technical_roles.iter().any(|r| r == role)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefinementSettings {
    /// Refinements allowed per task when the role has no override.
    pub max_attempts: u32,
    pub role_max_attempts: BTreeMap<String, u32>,
    /// Scores considered when classifying the trend.
    pub trend_window: usize,
    /// Minimum score change that counts as movement.
    pub trend_delta: f64,
    /// Stop refining once the trend is declining.
    pub stop_on_decline: bool,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            role_max_attempts: BTreeMap::new(),
            trend_window: 3,
            trend_delta: 5.0,
            stop_on_decline: true,
        }
    }
}

impl RefinementSettings {
    pub fn max_attempts_for(&self, role: &str) -> u32 {
        self.role_max_attempts
            .get(role)
            .copied()
            .unwrap_or(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_threshold_falls_back_to_default() {
        let q = QualitySettings::default();
        assert_eq!(q.threshold_for("security-auditor"), 85.0);
        assert_eq!(q.threshold_for("writer"), 70.0);
    }

    #[test]
    fn technical_role_membership() {
        let q = QualitySettings::default();
        assert!(q.is_technical("architect"));
        assert!(!q.is_technical("copywriter"));
    }

    #[test]
    fn role_max_attempts_override() {
        let r: RefinementSettings =
            serde_json::from_str(r#"{"roleMaxAttempts": {"architect": 1}}"#).unwrap();
        assert_eq!(r.max_attempts_for("architect"), 1);
        assert_eq!(r.max_attempts_for("other"), 3);
        assert_eq!(r.trend_window, 3);
    }
}
