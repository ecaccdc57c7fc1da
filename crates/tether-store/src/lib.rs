//! Durable bookkeeping for sub-agent session lineages.
//!
//! The [`SessionStore`] is the only shared mutable state in the pipeline.
//! Each session record lives behind its own lock, so counters are
//! linearized per session without a global lock, and every mutation is
//! written through to disk before it is acknowledged.

pub mod error;
pub mod persist;
pub mod record;
pub mod store;

pub use error::{AdmissionError, StoreError};
pub use record::{classify_trend, RefinementState, SessionRecord, SessionStatus, Trend};
pub use store::{SessionStore, StoreLimits};
