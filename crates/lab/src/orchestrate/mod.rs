//! Orchestration requests: free-form user intent in, running session out.

mod models;
mod repository;
mod service;
mod sse;

pub use models::{
    OrchestrateRequest, OrchestrateResponse, OrchestrationRequest, OrchestrationStatus,
};
pub use repository::OrchestrationRepository;
pub use service::OrchestrationService;
pub use sse::EventRing;
