//! In-process store. One lock over every table so the thread-busy check and
//! the run insert are atomic.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::records::{AssistantConfig, Thread, ThreadMessage};
use super::Store;
use crate::error::TurnstileError;
use crate::run::{Action, Run};

#[derive(Default)]
struct Tables {
    assistants: HashMap<String, AssistantConfig>,
    threads: HashMap<String, Thread>,
    messages: HashMap<String, Vec<ThreadMessage>>,
    runs: HashMap<String, Run>,
    actions: HashMap<String, Action>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, TurnstileError> {
        self.tables
            .lock()
            .map_err(|_| TurnstileError::Storage("store lock poisoned".into()))
    }

    /// Number of assistants, threads and runs currently stored.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.tables
            .lock()
            .map(|t| (t.assistants.len(), t.threads.len(), t.runs.len()))
            .unwrap_or_default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_assistant(&self, assistant: AssistantConfig) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        if tables.assistants.contains_key(&assistant.id) {
            return Err(TurnstileError::InvalidArgument(format!(
                "assistant {} already exists",
                assistant.id
            )));
        }
        tables.assistants.insert(assistant.id.clone(), assistant);
        Ok(())
    }

    async fn get_assistant(&self, id: &str) -> Result<AssistantConfig, TurnstileError> {
        self.lock()?
            .assistants
            .get(id)
            .cloned()
            .ok_or_else(|| TurnstileError::not_found("assistant", id))
    }

    async fn update_assistant(&self, assistant: AssistantConfig) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        match tables.assistants.get_mut(&assistant.id) {
            Some(existing) => {
                *existing = assistant;
                Ok(())
            }
            None => Err(TurnstileError::not_found("assistant", assistant.id)),
        }
    }

    async fn delete_assistant(&self, id: &str) -> Result<(), TurnstileError> {
        self.lock()?.assistants.remove(id);
        Ok(())
    }

    async fn create_thread(&self, thread: Thread) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        tables.messages.entry(thread.id.clone()).or_default();
        tables.threads.insert(thread.id.clone(), thread);
        Ok(())
    }

    async fn get_thread(&self, id: &str) -> Result<Thread, TurnstileError> {
        self.lock()?
            .threads
            .get(id)
            .cloned()
            .ok_or_else(|| TurnstileError::not_found("thread", id))
    }

    async fn delete_thread(&self, id: &str) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        tables.threads.remove(id);
        tables.messages.remove(id);
        let run_ids: Vec<String> = tables
            .runs
            .values()
            .filter(|run| run.thread_id == id)
            .map(|run| run.id.clone())
            .collect();
        for run_id in &run_ids {
            tables.runs.remove(run_id);
        }
        tables
            .actions
            .retain(|_, action| !run_ids.contains(&action.run_id));
        Ok(())
    }

    async fn append_message(&self, message: ThreadMessage) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        if !tables.threads.contains_key(&message.thread_id) {
            return Err(TurnstileError::not_found("thread", message.thread_id));
        }
        let messages = tables.messages.entry(message.thread_id.clone()).or_default();
        if !messages.iter().any(|m| m.id == message.id) {
            messages.push(message);
        }
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str) -> Result<Vec<ThreadMessage>, TurnstileError> {
        let tables = self.lock()?;
        if !tables.threads.contains_key(thread_id) {
            return Err(TurnstileError::not_found("thread", thread_id));
        }
        Ok(tables.messages.get(thread_id).cloned().unwrap_or_default())
    }

    async fn insert_run(&self, run: Run) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        if !tables.threads.contains_key(&run.thread_id) {
            return Err(TurnstileError::not_found("thread", run.thread_id));
        }
        if let Some(active) = tables
            .runs
            .values()
            .find(|existing| existing.thread_id == run.thread_id && !existing.is_terminal())
        {
            return Err(TurnstileError::ThreadBusy {
                thread_id: run.thread_id.clone(),
                run_id: active.id.clone(),
            });
        }
        tables.runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Run, TurnstileError> {
        self.lock()?
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| TurnstileError::not_found("run", id))
    }

    async fn update_run(&self, run: Run) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        match tables.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run;
                Ok(())
            }
            None => Err(TurnstileError::not_found("run", run.id)),
        }
    }

    async fn list_runs(&self, thread_id: &str) -> Result<Vec<Run>, TurnstileError> {
        let mut runs: Vec<Run> = self
            .lock()?
            .runs
            .values()
            .filter(|run| run.thread_id == thread_id)
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.created_at);
        Ok(runs)
    }

    async fn delete_run(&self, id: &str) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        tables.runs.remove(id);
        tables.actions.retain(|_, action| action.run_id != id);
        Ok(())
    }

    async fn insert_action(&self, action: Action) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        if !tables.runs.contains_key(&action.run_id) {
            return Err(TurnstileError::not_found("run", action.run_id));
        }
        tables.actions.insert(action.id.clone(), action);
        Ok(())
    }

    async fn get_action(&self, id: &str) -> Result<Action, TurnstileError> {
        self.lock()?
            .actions
            .get(id)
            .cloned()
            .ok_or_else(|| TurnstileError::not_found("action", id))
    }

    async fn update_action(&self, action: Action) -> Result<(), TurnstileError> {
        let mut tables = self.lock()?;
        match tables.actions.get_mut(&action.id) {
            Some(existing) => {
                *existing = action;
                Ok(())
            }
            None => Err(TurnstileError::not_found("action", action.id)),
        }
    }

    async fn list_actions(&self, run_id: &str) -> Result<Vec<Action>, TurnstileError> {
        let mut actions: Vec<Action> = self
            .lock()?
            .actions
            .values()
            .filter(|action| action.run_id == run_id)
            .cloned()
            .collect();
        actions.sort_by_key(|action| action.created_at);
        Ok(actions)
    }
}
