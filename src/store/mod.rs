//! Persistence collaborator: the database of record for assistants,
//! threads, messages, runs and actions.

mod memory;
pub mod records;

pub use memory::InMemoryStore;
pub use records::{AssistantConfig, AssistantTool, Thread, ThreadMessage};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TurnstileError;
use crate::run::{Action, Run};

/// `<prefix>_<uuid>` record id.
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// Lookups of a missing id fail with `NotFound`. Deletes are idempotent.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_assistant(&self, assistant: AssistantConfig) -> Result<(), TurnstileError>;
    async fn get_assistant(&self, id: &str) -> Result<AssistantConfig, TurnstileError>;
    async fn update_assistant(&self, assistant: AssistantConfig) -> Result<(), TurnstileError>;
    async fn delete_assistant(&self, id: &str) -> Result<(), TurnstileError>;

    async fn create_thread(&self, thread: Thread) -> Result<(), TurnstileError>;
    async fn get_thread(&self, id: &str) -> Result<Thread, TurnstileError>;
    /// Removes the thread with its messages, runs and their actions.
    async fn delete_thread(&self, id: &str) -> Result<(), TurnstileError>;

    /// Appending a message id that already exists is a no-op.
    async fn append_message(&self, message: ThreadMessage) -> Result<(), TurnstileError>;
    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, TurnstileError>;

    /// Fails with `ThreadBusy` while the thread has a non-terminal run.
    async fn insert_run(&self, run: Run) -> Result<(), TurnstileError>;
    async fn get_run(&self, id: &str) -> Result<Run, TurnstileError>;
    async fn update_run(&self, run: Run) -> Result<(), TurnstileError>;
    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>, TurnstileError>;
    /// Removes the run and its actions.
    async fn delete_run(&self, id: &str) -> Result<(), TurnstileError>;

    async fn insert_action(&self, action: Action) -> Result<(), TurnstileError>;
    async fn get_action(&self, id: &str) -> Result<Action, TurnstileError>;
    async fn update_action(&self, action: Action) -> Result<(), TurnstileError>;
    async fn list_actions(&self, run_id: &str) -> Result<Vec<Action>, TurnstileError>;
}
