//! Run lifecycle: records, event stream and the orchestrator that drives them.

pub mod events;
mod orchestrator;
pub mod types;

pub use events::{RunEvent, RunEventPayload};
pub use orchestrator::{Orchestrator, OrchestratorOptions, RunEventStream};
pub use types::{Action, ActionStatus, RequiredAction, Run, RunStatus};
