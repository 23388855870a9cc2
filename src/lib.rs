//! Turnstile: orchestration core for multi-backend LLM turns.
//!
//! Routes each turn to a backend, normalizes the backend's streaming output
//! into one canonical event stream, dispatches tool calls, and tracks every
//! turn as a run with an explicit lifecycle.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use turnstile::prelude::*;
//!
//! # async fn example() -> turnstile::error::Result<()> {
//! let config = TurnstileConfig::from_env();
//! let store = Arc::new(InMemoryStore::new());
//! let arbiter = Arc::new(ProviderArbiter::new(
//!     config.route_table()?,
//!     Arc::new(HttpProviderFactory::new(config.clone())),
//!     store.clone(),
//!     None,
//!     ArbiterOptions::from_settings(config.settings()),
//! ));
//! let orchestrator = Orchestrator::new(arbiter, ToolRegistry::new(), OrchestratorOptions::default());
//!
//! let assistant = AssistantConfig::new("openai:gpt-4o", "Be brief.");
//! store.create_assistant(assistant.clone()).await?;
//! let thread = Thread::new();
//! store.create_thread(thread.clone()).await?;
//! store.append_message(ThreadMessage::new(&thread.id, None, ModelMessage::user("Hello!"))).await?;
//!
//! let run = orchestrator.create_run(&thread.id, &assistant.id).await?;
//! let run = orchestrator.run_to_completion(&run.id).await?;
//! println!("{}", run.status);
//! # Ok(())
//! # }
//! ```

pub mod arbiter;
pub mod cache;
pub mod config;
pub mod context;
pub mod delegation;
pub mod error;
pub mod models;
pub mod normalize;
pub mod prelude;
pub mod provider;
pub mod run;
pub mod store;
pub mod tools;
pub mod types;
pub mod util;
pub mod worker;

#[cfg(feature = "cli")]
pub mod cli;
