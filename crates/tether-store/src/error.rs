/// Safety-limit rejections. These are always surfaced to the caller.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("depth exceeded: {depth} > {max}")]
    DepthExceeded { depth: u32, max: u32 },

    #[error("call budget exceeded: {calls} of {max} calls used")]
    CallBudgetExceeded { calls: u32, max: u32 },

    #[error("refinement budget exceeded: {count} of {max} refinements used")]
    RefinementBudgetExceeded { count: u32, max: u32 },

    #[error("sub-agent session {0} cannot spawn children")]
    SubAgentCannotSpawn(String),

    #[error("parallel limit exceeded: {requested} > {max}")]
    ParallelLimitExceeded { requested: usize, max: usize },
}

impl AdmissionError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DepthExceeded { .. } => "depth_exceeded",
            Self::CallBudgetExceeded { .. } => "call_budget_exceeded",
            Self::RefinementBudgetExceeded { .. } => "refinement_budget_exceeded",
            Self::SubAgentCannotSpawn(_) => "sub_agent_cannot_spawn",
            Self::ParallelLimitExceeded { .. } => "parallel_limit_exceeded",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {0} is no longer active")]
    Inactive(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn is_admission(&self) -> bool {
        matches!(self, Self::Admission(_))
    }

    pub fn admission(&self) -> Option<&AdmissionError> {
        match self {
            Self::Admission(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_distinguished() {
        let e: StoreError = AdmissionError::DepthExceeded { depth: 3, max: 2 }.into();
        assert!(e.is_admission());
        assert_eq!(e.admission().map(AdmissionError::kind), Some("depth_exceeded"));
        assert_eq!(e.to_string(), "depth exceeded: 3 > 2");

        let io: StoreError = std::io::Error::other("disk full").into();
        assert!(!io.is_admission());
    }
}
