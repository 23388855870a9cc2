//! Run lifecycle orchestrator.
//!
//! Each streamed run is driven by one spawned task. State changes go through
//! a per-run gate so the driver, `cancel_run` and action submissions never
//! interleave a read-modify-write of the same record. A run that has entered
//! `cancelling` only moves to `cancelled`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{RunEvent, RunEventEmitter};
use super::types::{Action, ActionStatus, RequiredAction, Run, RunStatus};
use crate::arbiter::ProviderArbiter;
use crate::config::Settings;
use crate::delegation::{DelegationOptions, Delegator};
use crate::error::{RunError, RunErrorCode, TurnstileError};
use crate::store::{Store, ThreadMessage};
use crate::tools::{ToolExecutionContext, ToolRegistry};
use crate::types::{AgentToolCall, CanonicalEvent, ModelMessage, StreamErrorKind};
use crate::util::retry::RetryPolicy;
use crate::worker::TurnRequest;

/// Events of one streamed run, ending after its terminal status.
pub type RunEventStream = BoxStream<'static, RunEvent>;

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Fallback re-check interval while waiting on actions.
    pub poll_interval: Duration,
    /// Poll ticks allowed in `requires_action` before the run expires.
    pub max_poll_iterations: usize,
    /// Model turns allowed per run.
    pub max_resumptions: usize,
    pub delegation: DelegationOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_poll_iterations: 1200,
            max_resumptions: 20,
            delegation: DelegationOptions::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.runs.poll_interval(),
            max_poll_iterations: settings.runs.max_poll_iterations,
            max_resumptions: settings.runs.max_resumptions,
            delegation: DelegationOptions {
                timeout: settings.delegation.timeout(),
                model: settings.delegation.model.clone(),
                ..DelegationOptions::default()
            },
        }
    }
}

struct RunControl {
    cancel: CancellationToken,
    wake: Notify,
    gate: tokio::sync::Mutex<()>,
    driving: AtomicBool,
}

impl RunControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            gate: tokio::sync::Mutex::new(()),
            driving: AtomicBool::new(false),
        }
    }
}

enum ActionWait {
    Resolved(Vec<Action>),
    Cancelled,
    Expired { waited_ms: u64 },
}

enum TurnEnd {
    Continue,
    Done,
}

struct OrchestratorInner {
    arbiter: Arc<ProviderArbiter>,
    store: Arc<dyn Store>,
    tools: ToolRegistry,
    options: OrchestratorOptions,
    controls: Mutex<HashMap<String, Arc<RunControl>>>,
}

/// Drives runs from `queued` to a terminal status. Clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("tools", &self.inner.tools)
            .field("options", &self.inner.options)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(arbiter: Arc<ProviderArbiter>, tools: ToolRegistry, options: OrchestratorOptions) -> Self {
        let store = Arc::clone(arbiter.store());
        Self {
            inner: Arc::new(OrchestratorInner {
                arbiter,
                store,
                tools,
                options,
                controls: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn arbiter(&self) -> &Arc<ProviderArbiter> {
        &self.inner.arbiter
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.inner.tools
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.inner.options
    }

    pub fn delegator(&self) -> Delegator {
        Delegator::new(self.clone(), self.inner.options.delegation.clone())
    }

    fn control(&self, run_id: &str) -> Arc<RunControl> {
        let mut controls = self
            .inner
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            controls
                .entry(run_id.to_string())
                .or_insert_with(|| Arc::new(RunControl::new())),
        )
    }

    fn release(&self, run_id: &str) {
        let mut controls = self
            .inner
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        controls.remove(run_id);
    }

    /// Drop `control` and forget the run's entry if no driver and no other
    /// caller holds it. New holders only come from `control()`, which takes
    /// the same map lock, so the count cannot grow while it is checked.
    fn release_if_idle(&self, run_id: &str, control: Arc<RunControl>) {
        let mut controls = self
            .inner
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = controls.get(run_id).is_some_and(|entry| {
            Arc::ptr_eq(entry, &control)
                && Arc::strong_count(&control) == 2
                && !control.driving.load(Ordering::SeqCst)
        });
        if idle {
            controls.remove(run_id);
        }
    }

    /// Runs whose cancellation and wakeup state is currently held in memory.
    pub fn tracked_runs(&self) -> usize {
        self.inner
            .controls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Queue a run. Fails with `ThreadBusy` while the thread has another
    /// non-terminal run.
    pub async fn create_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run, TurnstileError> {
        self.inner.store.get_thread(thread_id).await?;
        self.inner.arbiter.get_assistant_config(assistant_id).await?;
        let run = Run::new(thread_id, assistant_id);
        self.inner.store.insert_run(run.clone()).await?;
        info!(run_id = %run.id, thread_id, assistant_id, "run created");
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Run, TurnstileError> {
        self.inner.store.get_run(run_id).await
    }

    pub async fn list_actions(&self, run_id: &str) -> Result<Vec<Action>, TurnstileError> {
        self.inner.store.list_actions(run_id).await
    }

    /// Start driving a queued run and return its event stream.
    ///
    /// The run keeps going if the stream is dropped.
    pub async fn stream_run(&self, run_id: &str) -> Result<RunEventStream, TurnstileError> {
        self.inner.store.get_run(run_id).await?;
        let control = self.control(run_id);
        let admitted: Result<(), TurnstileError> = async {
            let _gate = control.gate.lock().await;
            let run = self.inner.store.get_run(run_id).await?;
            if run.status != RunStatus::Queued {
                return Err(TurnstileError::InvalidState(format!(
                    "run {run_id} is {} and cannot be started",
                    run.status
                )));
            }
            if control.driving.swap(true, Ordering::SeqCst) {
                return Err(TurnstileError::InvalidState(format!(
                    "run {run_id} is already streaming"
                )));
            }
            Ok(())
        }
        .await;
        if let Err(err) = admitted {
            self.release_if_idle(run_id, control);
            return Err(err);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = RunEventEmitter::new(run_id, tx);
        let this = self.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            this.drive(run_id, control, emitter).await;
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    /// Drive a queued run and wait for its terminal record.
    pub async fn run_to_completion(&self, run_id: &str) -> Result<Run, TurnstileError> {
        let mut events = self.stream_run(run_id).await?;
        while events.next().await.is_some() {}
        self.get_run(run_id).await
    }

    /// Complete a pending action with the caller's tool output.
    pub async fn submit_tool_output(
        &self,
        action_id: &str,
        output: impl Into<String>,
    ) -> Result<Action, TurnstileError> {
        let output = output.into();
        self.resolve_action(action_id, move |action| {
            action.status = ActionStatus::Completed;
            action.output = Some(output);
        })
        .await
    }

    /// Record that the caller's tool failed. The model sees `error` as an
    /// error tool result.
    pub async fn fail_action(
        &self,
        action_id: &str,
        error: impl Into<String>,
    ) -> Result<Action, TurnstileError> {
        let error = error.into();
        self.resolve_action(action_id, move |action| {
            action.status = ActionStatus::Failed;
            action.error = Some(error);
        })
        .await
    }

    async fn resolve_action<F>(&self, action_id: &str, apply: F) -> Result<Action, TurnstileError>
    where
        F: FnOnce(&mut Action),
    {
        let run_id = self.inner.store.get_action(action_id).await?.run_id;
        let control = self.control(&run_id);
        let resolved: Result<Action, TurnstileError> = async {
            let _gate = control.gate.lock().await;
            let mut action = self.inner.store.get_action(action_id).await?;
            if action.is_resolved() {
                return Err(TurnstileError::InvalidState(format!(
                    "action {action_id} is already {}",
                    action.status
                )));
            }
            let run = self.inner.store.get_run(&run_id).await?;
            if run.status != RunStatus::RequiresAction {
                return Err(TurnstileError::InvalidState(format!(
                    "run {run_id} is {}, not requires_action",
                    run.status
                )));
            }
            apply(&mut action);
            action.completed_at = Some(Utc::now());
            self.inner.store.update_action(action.clone()).await?;
            Ok(action)
        }
        .await;
        if let Ok(action) = &resolved {
            debug!(run_id = %run_id, action_id, status = %action.status, "action resolved");
            control.wake.notify_one();
        }
        self.release_if_idle(&run_id, control);
        resolved
    }

    /// Request cancellation. A run nobody is driving is cancelled at once;
    /// otherwise the driver finishes it at the next event boundary or after
    /// the platform tool it is running. Terminal runs are returned unchanged.
    pub async fn cancel_run(&self, run_id: &str) -> Result<Run, TurnstileError> {
        self.inner.store.get_run(run_id).await?;
        let control = self.control(run_id);
        let cancelled: Result<Run, TurnstileError> = async {
            let _gate = control.gate.lock().await;
            let mut run = self.inner.store.get_run(run_id).await?;
            if !run.is_terminal() && run.status != RunStatus::Cancelling {
                run.transition(RunStatus::Cancelling)?;
                if !control.driving.load(Ordering::SeqCst) {
                    run.transition(RunStatus::Cancelled)?;
                }
                self.persist(&run).await?;
                info!(run_id, status = %run.status, "run cancellation requested");
            }
            Ok(run)
        }
        .await;
        if cancelled.is_ok() {
            control.cancel.cancel();
            control.wake.notify_one();
        }
        self.release_if_idle(run_id, control);
        cancelled
    }

    async fn persist(&self, run: &Run) -> Result<(), TurnstileError> {
        RetryPolicy::for_storage()
            .execute(|| self.inner.store.update_run(run.clone()))
            .await
    }

    async fn append_tool_result(
        &self,
        run: &Run,
        call_id: &str,
        result: Value,
        is_error: bool,
    ) -> Result<(), TurnstileError> {
        let message = ThreadMessage::new(
            &run.thread_id,
            Some(run.id.clone()),
            ModelMessage::tool_result(call_id, result, is_error),
        );
        RetryPolicy::for_storage()
            .execute(|| self.inner.store.append_message(message.clone()))
            .await
    }

    /// Apply `edit` under the run's gate. Returns `None` without touching
    /// the record when the run is being cancelled.
    async fn advance<F>(
        &self,
        run_id: &str,
        control: &RunControl,
        emitter: &RunEventEmitter,
        edit: F,
    ) -> Result<Option<Run>, TurnstileError>
    where
        F: FnOnce(&mut Run) -> Result<(), TurnstileError>,
    {
        let _gate = control.gate.lock().await;
        let mut run = self.inner.store.get_run(run_id).await?;
        if run.status == RunStatus::Cancelling {
            return Ok(None);
        }
        let before = run.status;
        edit(&mut run)?;
        self.persist(&run).await?;
        if run.status != before {
            emitter.status(run.status);
        }
        Ok(Some(run))
    }

    /// Move the run to a terminal status. A run in `cancelling` always ends
    /// `cancelled`, whatever was asked.
    async fn finish(
        &self,
        run_id: &str,
        control: &RunControl,
        emitter: &RunEventEmitter,
        status: RunStatus,
        error: Option<RunError>,
    ) -> Result<Run, TurnstileError> {
        let _gate = control.gate.lock().await;
        let mut run = self.inner.store.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        let status = if run.status == RunStatus::Cancelling {
            RunStatus::Cancelled
        } else {
            status
        };
        if status == RunStatus::Cancelled {
            if run.status != RunStatus::Cancelling {
                run.transition(RunStatus::Cancelling)?;
            }
            emitter.status(RunStatus::Cancelling);
        } else if error.is_some() {
            run.last_error = error;
        }
        run.transition(status)?;
        self.persist(&run).await?;
        emitter.status(status);
        info!(run_id, status = %status, turns = run.turns, "run finished");
        Ok(run)
    }

    async fn drive(self, run_id: String, control: Arc<RunControl>, emitter: RunEventEmitter) {
        if let Err(err) = self.drive_run(&run_id, &control, &emitter).await {
            warn!(run_id = %run_id, error = %err, "run failed");
            let recorded = self
                .finish(&run_id, &control, &emitter, RunStatus::Failed, Some(err.to_run_error()))
                .await;
            if let Err(store_err) = recorded {
                warn!(run_id = %run_id, error = %store_err, "could not record run failure");
            }
        }
        control.driving.store(false, Ordering::SeqCst);
        self.release(&run_id);
    }

    async fn drive_run(
        &self,
        run_id: &str,
        control: &RunControl,
        emitter: &RunEventEmitter,
    ) -> Result<(), TurnstileError> {
        let run = self.inner.store.get_run(run_id).await?;
        let assistant = self.inner.arbiter.get_assistant_config(&run.assistant_id).await?;
        let worker = self.inner.arbiter.resolve(&assistant.model).await?;
        let tool_definitions = self.inner.tools.definitions_for(&assistant.tools);
        let max_resumptions = self.inner.options.max_resumptions;

        loop {
            if control.cancel.is_cancelled() {
                self.finish(run_id, control, emitter, RunStatus::Cancelled, None).await?;
                return Ok(());
            }
            let started = self
                .advance(run_id, control, emitter, |run| {
                    run.turns += 1;
                    if run.status != RunStatus::InProgress {
                        run.transition(RunStatus::InProgress)?;
                    }
                    Ok(())
                })
                .await?;
            let Some(run) = started else {
                self.finish(run_id, control, emitter, RunStatus::Cancelled, None).await?;
                return Ok(());
            };
            if run.turns > max_resumptions {
                return Err(TurnstileError::InvalidState(format!(
                    "run exceeded {max_resumptions} model turns"
                )));
            }

            let mut events = worker.stream(TurnRequest {
                run_id: run.id.clone(),
                thread_id: run.thread_id.clone(),
                instructions: assistant.instructions.clone(),
                tools: tool_definitions.clone(),
                settings: assistant.settings.clone(),
            });

            let mut calls: Vec<AgentToolCall> = Vec::new();
            let mut failure: Option<RunError> = None;
            let cancelled = loop {
                let next = tokio::select! {
                    biased;
                    _ = control.cancel.cancelled() => break true,
                    next = events.next() => next,
                };
                let Some(event) = next else { break false };
                match &event {
                    CanonicalEvent::ToolCallComplete { call_id, name, arguments } => {
                        calls.push(AgentToolCall {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        });
                    }
                    CanonicalEvent::Error { kind, message } => {
                        failure = Some(RunError::new(error_code(*kind), message.clone()));
                    }
                    _ => {}
                }
                emitter.event(event);
            };
            drop(events);

            if cancelled {
                self.finish(run_id, control, emitter, RunStatus::Cancelled, None).await?;
                return Ok(());
            }
            if let Some(error) = failure {
                self.finish(run_id, control, emitter, RunStatus::Failed, Some(error)).await?;
                return Ok(());
            }

            let mut calls = calls.into_iter();
            let Some(call) = calls.next() else {
                self.finish(run_id, control, emitter, RunStatus::Completed, None).await?;
                return Ok(());
            };
            for skipped in calls {
                let note = format!(
                    "tool call '{}' was not executed: only one tool call runs per turn, request it again if it is still needed",
                    skipped.name
                );
                self.append_tool_result(&run, &skipped.id, json!(note), true).await?;
            }

            match self.dispatch(&run, &assistant, &call, control, emitter).await? {
                TurnEnd::Continue => {}
                TurnEnd::Done => return Ok(()),
            }
        }
    }

    async fn dispatch(
        &self,
        run: &Run,
        assistant: &crate::store::AssistantConfig,
        call: &AgentToolCall,
        control: &RunControl,
        emitter: &RunEventEmitter,
    ) -> Result<TurnEnd, TurnstileError> {
        let Some(declared) = assistant.tool(&call.name) else {
            warn!(run_id = %run.id, tool = %call.name, "model called an undeclared tool");
            let note = format!("tool '{}' is not available to this assistant", call.name);
            self.append_tool_result(run, &call.id, json!(note), true).await?;
            return Ok(TurnEnd::Continue);
        };

        if declared.is_platform() {
            debug!(run_id = %run.id, tool = %call.name, "executing platform tool");
            let ctx = ToolExecutionContext {
                run_id: run.id.clone(),
                thread_id: run.thread_id.clone(),
                call_id: call.id.clone(),
                model: assistant.model.clone(),
                orchestrator: Some(self.clone()),
            };
            let outcome = self
                .inner
                .tools
                .execute(&call.name, call.arguments.clone(), &ctx)
                .await;
            self.append_tool_result(run, &call.id, outcome.result, outcome.is_error)
                .await?;
            return Ok(TurnEnd::Continue);
        }

        let action = Action::pending(&run.id, &call.id, &call.name, call.arguments.clone());
        self.inner.store.insert_action(action.clone()).await?;
        let blocked = self
            .advance(&run.id, control, emitter, |run| {
                run.required_action = Some(RequiredAction::SubmitToolOutputs {
                    actions: vec![action.clone()],
                });
                run.transition(RunStatus::RequiresAction)
            })
            .await?;
        if blocked.is_none() {
            self.append_tool_result(run, &call.id, json!("run was cancelled before the tool ran"), true)
                .await?;
            self.finish(&run.id, control, emitter, RunStatus::Cancelled, None).await?;
            return Ok(TurnEnd::Done);
        }
        info!(run_id = %run.id, action_id = %action.id, tool = %call.name, "run requires action");

        match self.wait_for_actions(&run.id, control, &[action.id.clone()]).await? {
            ActionWait::Resolved(actions) => {
                for action in actions {
                    let (result, is_error) = match action.status {
                        ActionStatus::Failed => (
                            json!(action.error.unwrap_or_else(|| "tool execution failed".into())),
                            true,
                        ),
                        _ => (json!(action.output.unwrap_or_default()), false),
                    };
                    self.append_tool_result(run, &action.call_id, result, is_error)
                        .await?;
                }
                let requeued = self
                    .advance(&run.id, control, emitter, |run| run.transition(RunStatus::Queued))
                    .await?;
                if requeued.is_none() {
                    self.finish(&run.id, control, emitter, RunStatus::Cancelled, None).await?;
                    return Ok(TurnEnd::Done);
                }
                Ok(TurnEnd::Continue)
            }
            ActionWait::Cancelled => {
                self.append_tool_result(run, &call.id, json!("run was cancelled before the tool output arrived"), true)
                    .await?;
                self.finish(&run.id, control, emitter, RunStatus::Cancelled, None).await?;
                Ok(TurnEnd::Done)
            }
            ActionWait::Expired { waited_ms } => {
                warn!(run_id = %run.id, waited_ms, "tool outputs not submitted in time");
                self.append_tool_result(run, &call.id, json!("no tool output was submitted before the run expired"), true)
                    .await?;
                let error = TurnstileError::ActionTimeout { waited_ms }.to_run_error();
                self.finish(&run.id, control, emitter, RunStatus::Expired, Some(error)).await?;
                Ok(TurnEnd::Done)
            }
        }
    }

    /// Wait until every action in `ids` is resolved. Wakes on submissions,
    /// on cancellation, and every poll interval for records updated behind
    /// the orchestrator's back. Expires after `max_poll_iterations` ticks.
    async fn wait_for_actions(
        &self,
        run_id: &str,
        control: &RunControl,
        ids: &[String],
    ) -> Result<ActionWait, TurnstileError> {
        let started = Instant::now();
        let interval = self.inner.options.poll_interval;
        let mut ticks = 0usize;
        loop {
            let woken = control.wake.notified();
            tokio::pin!(woken);

            let actions: Vec<Action> = self
                .inner
                .store
                .list_actions(run_id)
                .await?
                .into_iter()
                .filter(|action| ids.contains(&action.id))
                .collect();
            if actions.len() == ids.len() && actions.iter().all(Action::is_resolved) {
                return Ok(ActionWait::Resolved(actions));
            }
            if ticks >= self.inner.options.max_poll_iterations {
                return Ok(ActionWait::Expired {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::select! {
                biased;
                _ = control.cancel.cancelled() => return Ok(ActionWait::Cancelled),
                _ = &mut woken => {}
                _ = tokio::time::sleep(interval) => ticks += 1,
            }
        }
    }
}

fn error_code(kind: StreamErrorKind) -> RunErrorCode {
    match kind {
        StreamErrorKind::MalformedToolCall => RunErrorCode::MalformedToolCall,
        StreamErrorKind::Storage => RunErrorCode::Storage,
        StreamErrorKind::Upstream | StreamErrorKind::Timeout => RunErrorCode::UpstreamStream,
    }
}
