//! Request processing: scheduling, ingestion hand-off, generation, delivery.

pub mod delivery;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;
pub mod typing;

pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionOutcome};
pub use pipeline::{ActiveSessions, RequestPipeline, StopOutcome};
pub use scheduler::{Enqueued, RequestHandler, RequestQueue};
