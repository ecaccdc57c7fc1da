pub mod context;
pub mod error;
pub mod normalizer;
pub mod orchestrator;
pub mod pipeline;
pub mod quality;
pub mod refinement;
pub mod registry;
pub mod roles;
pub mod truncate;

pub use context::{CompressRequest, CompressedContext, ContextWindowManager, IntegrityViolation};
pub use error::EngineError;
pub use normalizer::{Corrector, Normalized, ProviderCorrector, ResponseNormalizer};
pub use orchestrator::{Orchestrator, SpawnOutcome, SpawnRequest, UsageMetadata};
pub use pipeline::{AttemptOutcome, InvocationPipeline};
pub use quality::{QualityValidator, ValidationContext};
pub use refinement::{build_refinement_prompt, RefinementController, RefinementDecision, StopReason};
pub use registry::ToolRegistry;
pub use roles::StaticRoleCatalog;
