use async_trait::async_trait;

use crate::ids::SessionId;
use crate::result::MemoryOperation;

#[derive(Debug, thiserror::Error)]
pub enum MemorySinkError {
    #[error("memory sink rejected operations: {0}")]
    Rejected(String),
    #[error("memory sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for the memory side-effects proposed by a result.
/// Payloads are opaque to the pipeline.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn submit(
        &self,
        session_id: &SessionId,
        operations: &[MemoryOperation],
    ) -> Result<(), MemorySinkError>;
}
