use tether_core::errors::GatewayError;
use tether_core::role::RoleError;
use tether_store::{AdmissionError, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A safety limit refused the request.
    #[error("admission rejected: {0}")]
    Admission(AdmissionError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Role(#[from] RoleError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
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

impl From<AdmissionError> for EngineError {
    fn from(e: AdmissionError) -> Self {
        EngineError::Admission(e)
    }
}

// Admission rejections keep their identity across the crate seam.
impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Admission(a) => EngineError::Admission(a),
            other => EngineError::Store(other),
        }
    }
}
