//! Convenience re-exports for common use.

pub use crate::arbiter::{ArbiterOptions, ProviderArbiter};
pub use crate::cache::{FastCache, InMemoryCache};
pub use crate::config::TurnstileConfig;
pub use crate::delegation::{DelegationRequest, Delegator};
pub use crate::error::{Result, TurnstileError};
pub use crate::provider::{HttpProviderFactory, ModelProvider, ProviderFactory};
pub use crate::run::{Action, Orchestrator, OrchestratorOptions, Run, RunEvent, RunStatus};
pub use crate::store::{AssistantConfig, AssistantTool, InMemoryStore, Store, Thread, ThreadMessage};
pub use crate::tools::{Tool, ToolRegistry};
pub use crate::types::{CanonicalEvent, GenerationSettings, ModelMessage, Role};
