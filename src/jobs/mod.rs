//! Case study generation jobs
//!
//! - `model` - job state machine, scope validation, summaries
//! - `template` - section plans per template type
//! - `extract` - summary / insight / recommendation extraction
//! - `engine` - content engine seam (HTTP and outline implementations)
//! - `store` - job persistence seam
//! - `orchestrator` - create, cancel, get, list, delete and the background runner

pub mod engine;
pub mod error;
pub mod extract;
pub mod model;
pub mod orchestrator;
pub mod store;
pub mod template;

pub use engine::{
    ContentEngine, DeltaStream, EngineError, HttpContentEngine, OutlineEngine, SectionRequest,
    SourceAccess,
};
pub use error::JobError;
pub use extract::Artifacts;
pub use model::{
    DateRange, GenerationJob, GenerationOptions, GenerationRequest, JobHandle, JobStatus,
    JobSummary, ProjectScope, TemplateType,
};
pub use orchestrator::{GenerationJobOrchestrator, OrchestratorConfig};
pub use store::{InMemoryJobStore, JobStore};
pub use template::SectionPlan;
