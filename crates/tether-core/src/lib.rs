//! Shared domain types for the tether sub-agent pipeline.

pub mod errors;
pub mod fingerprint;
pub mod ids;
pub mod memory;
pub mod messages;
pub mod provider;
pub mod quality;
pub mod result;
pub mod role;
pub mod tokens;
pub mod tools;
