//! Delegation: run a sub-task on a disposable assistant, thread and run,
//! and hand back only the final answer.
//!
//! The ephemeral assistant gets the research tools only, so a delegated run
//! can never delegate again. Nothing from the ephemeral thread reaches the
//! parent; the caller decides what to do with the returned text.

use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::error::TurnstileError;
use crate::run::{Orchestrator, RunEventStream, RunStatus};
use crate::store::{AssistantConfig, Thread, ThreadMessage};
use crate::tools::ToolCategory;
use crate::types::{ModelMessage, Role};

#[derive(Debug, Clone)]
pub struct DelegationOptions {
    /// Wall-clock budget for one delegated run, independent of the parent.
    pub timeout: Duration,
    /// Model forced for delegated runs unless the request names one.
    pub model: Option<String>,
    /// How long a timed-out run may take to honour its cancellation before
    /// the caller gets its answer anyway. The run then settles, and its
    /// records are removed, in the background.
    pub settle_grace: Duration,
}

impl Default for DelegationOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            model: None,
            settle_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelegationRequest {
    pub task: String,
    pub constraints: Vec<String>,
    /// Explicit `provider:model` for the sub-run.
    pub model: Option<String>,
    /// Model of the run that delegated; the last fallback.
    pub parent_model: Option<String>,
}

impl DelegationRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

fn worker_instructions(constraints: &[String]) -> String {
    let mut instructions = String::from(
        "You are a research worker handling one delegated task. Use the available tools as needed, \
         then reply with the final answer only.",
    );
    if !constraints.is_empty() {
        instructions.push_str("\n\nConstraints:");
        for constraint in constraints {
            instructions.push_str("\n- ");
            instructions.push_str(constraint);
        }
    }
    instructions
}

/// Where an ephemeral run stood when `run_ephemeral` returned.
enum Ephemeral {
    Answered(String),
    /// Cancelled after its budget ran out, but not yet settled.
    Unsettled(RunEventStream),
}

fn failure(err: TurnstileError) -> TurnstileError {
    match err {
        TurnstileError::DelegationFailure(_) => err,
        other => TurnstileError::DelegationFailure(other.to_string()),
    }
}

/// Runs delegated tasks through the orchestrator that owns it.
#[derive(Debug, Clone)]
pub struct Delegator {
    orchestrator: Orchestrator,
    options: DelegationOptions,
}

impl Delegator {
    pub fn new(orchestrator: Orchestrator, options: DelegationOptions) -> Self {
        Self {
            orchestrator,
            options,
        }
    }

    /// Run `request` to completion and return the last assistant text.
    /// Every failure is a `DelegationFailure`. Ephemeral records are removed
    /// on every path, after the ephemeral run has settled.
    ///
    /// Returns within `timeout + settle_grace` even when a cancelled run is
    /// stuck inside a tool.
    pub async fn delegate(&self, request: DelegationRequest) -> Result<String, TurnstileError> {
        let model = request
            .model
            .clone()
            .or_else(|| self.options.model.clone())
            .or_else(|| request.parent_model.clone())
            .ok_or_else(|| TurnstileError::DelegationFailure("no model available for delegated task".into()))?;

        let tools = self.orchestrator.tools().tools_in(ToolCategory::Research);
        let assistant = AssistantConfig::new(model, worker_instructions(&request.constraints))
            .with_name("delegated-research")
            .with_tools(tools);
        let mut thread = Thread::new();
        thread.metadata.insert("ephemeral".into(), "true".into());

        info!(assistant_id = %assistant.id, thread_id = %thread.id, model = %assistant.model, "delegating task");
        let answer = match self.run_ephemeral(&assistant, &thread, &request.task).await {
            Ok(Ephemeral::Answered(text)) => Ok(text),
            Ok(Ephemeral::Unsettled(mut events)) => {
                let delegator = self.clone();
                tokio::spawn(async move {
                    while events.next().await.is_some() {}
                    delegator.cleanup(&assistant.id, &thread.id).await;
                });
                return Err(self.timed_out());
            }
            Err(err) => Err(err),
        };
        self.cleanup(&assistant.id, &thread.id).await;
        answer.map_err(failure)
    }

    fn timed_out(&self) -> TurnstileError {
        TurnstileError::DelegationFailure(format!(
            "timed out after {}s",
            self.options.timeout.as_secs()
        ))
    }

    async fn run_ephemeral(
        &self,
        assistant: &AssistantConfig,
        thread: &Thread,
        task: &str,
    ) -> Result<Ephemeral, TurnstileError> {
        let store = self.orchestrator.store();
        store.create_assistant(assistant.clone()).await?;
        store.create_thread(thread.clone()).await?;
        store
            .append_message(ThreadMessage::new(&thread.id, None, ModelMessage::user(task)))
            .await?;

        let run = self.orchestrator.create_run(&thread.id, &assistant.id).await?;
        let mut events = self.orchestrator.stream_run(&run.id).await?;
        let drained = tokio::time::timeout(self.options.timeout, async {
            while events.next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(run_id = %run.id, timeout_secs = self.options.timeout.as_secs(), "delegated run timed out");
            self.orchestrator.cancel_run(&run.id).await?;
            let settled = tokio::time::timeout(self.options.settle_grace, async {
                while events.next().await.is_some() {}
            })
            .await;
            if settled.is_err() {
                warn!(run_id = %run.id, "cancelled sub-run still busy, settling in background");
                return Ok(Ephemeral::Unsettled(events));
            }
            return Err(self.timed_out());
        }

        let run = self.orchestrator.get_run(&run.id).await?;
        if run.status != RunStatus::Completed {
            let reason = run
                .last_error
                .map(|error| error.message)
                .unwrap_or_else(|| "no error recorded".into());
            return Err(TurnstileError::DelegationFailure(format!(
                "sub-run {}: {reason}",
                run.status
            )));
        }

        let answer = store
            .list_messages(&thread.id)
            .await?
            .into_iter()
            .rev()
            .find(|message| message.message.role == Role::Assistant && !message.message.text().is_empty())
            .map(|message| message.message.text());
        answer
            .map(Ephemeral::Answered)
            .ok_or_else(|| TurnstileError::DelegationFailure("sub-run produced no answer".into()))
    }

    async fn cleanup(&self, assistant_id: &str, thread_id: &str) {
        let store = self.orchestrator.store();
        if let Err(err) = store.delete_thread(thread_id).await {
            warn!(thread_id, error = %err, "failed to delete ephemeral thread");
        }
        if let Err(err) = store.delete_assistant(assistant_id).await {
            warn!(assistant_id, error = %err, "failed to delete ephemeral assistant");
        }
        self.orchestrator.arbiter().invalidate_assistant(assistant_id).await;
        debug!(assistant_id, thread_id, "ephemeral records removed");
    }
}
