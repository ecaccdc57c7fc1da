use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavioural definition of an agent role, supplied by a role catalog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoleDefinition {
    pub name: String,
    pub system_prompt: String,
    /// Keywords marking constraints that belong to this role's domain.
    #[serde(default)]
    pub domain_keywords: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RoleError {
    #[error("role not found: {0}")]
    NotFound(String),
}

/// Read-only lookup of role definitions.
pub trait RoleCatalog: Send + Sync {
    fn get_role(&self, name: &str) -> Result<RoleDefinition, RoleError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Urgency {
    /// Wall-clock budget for one attempt when nothing else is configured.
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Critical => Duration::from_secs(30),
            Self::High => Duration::from_secs(60),
            Self::Medium => Duration::from_secs(120),
            Self::Low => Duration::from_secs(300),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgency_timeouts_shrink_with_urgency() {
        assert_eq!(Urgency::Critical.default_timeout(), Duration::from_secs(30));
        assert_eq!(Urgency::Low.default_timeout(), Duration::from_secs(300));
        assert!(Urgency::High.default_timeout() < Urgency::Medium.default_timeout());
    }

    #[test]
    fn role_definition_keywords_optional() {
        let role: RoleDefinition =
            serde_json::from_str(r#"{"name":"architect","system_prompt":"Design."}"#).unwrap();
        assert!(role.domain_keywords.is_empty());
    }
}
