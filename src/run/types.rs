//! Run and action records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::error::{RunError, TurnstileError};
use crate::store::new_id;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Expired
        )
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match self {
            Queued => matches!(next, InProgress | Failed | Expired | Cancelling),
            InProgress => matches!(
                next,
                Completed | RequiresAction | Failed | Expired | Cancelling
            ),
            RequiresAction => matches!(next, Queued | Failed | Expired | Cancelling),
            Cancelling => matches!(next, Cancelled),
            Cancelled | Failed | Completed | Expired => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequiredAction {
    /// The caller must resolve these actions via `submit_tool_output`.
    SubmitToolOutputs { actions: Vec<Action> },
}

/// One orchestrated conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_action: Option<RequiredAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    /// Model turns taken so far.
    #[serde(default)]
    pub turns: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(thread_id: impl Into<String>, assistant_id: impl Into<String>) -> Self {
        Self {
            id: new_id("run"),
            thread_id: thread_id.into(),
            assistant_id: assistant_id.into(),
            status: RunStatus::Queued,
            required_action: None,
            last_error: None,
            turns: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
            expired_at: None,
        }
    }

    /// Move to `next`, validating the state graph and stamping timestamps.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), TurnstileError> {
        if !self.status.can_transition_to(next) {
            return Err(TurnstileError::InvalidState(format!(
                "run {} cannot move from {} to {next}",
                self.id, self.status
            )));
        }
        let now = Utc::now();
        match next {
            RunStatus::InProgress if self.started_at.is_none() => self.started_at = Some(now),
            RunStatus::Completed => self.completed_at = Some(now),
            RunStatus::Failed => self.failed_at = Some(now),
            RunStatus::Cancelled => self.cancelled_at = Some(now),
            RunStatus::Expired => self.expired_at = Some(now),
            _ => {}
        }
        if next != RunStatus::RequiresAction {
            self.required_action = None;
        }
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Completed,
    Failed,
}

/// A caller-executed tool call and its eventual result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub id: String,
    pub run_id: String,
    /// Tool-call id the model assigned; the tool result answers this id.
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Action {
    pub fn pending(
        run_id: impl Into<String>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            id: new_id("act"),
            run_id: run_id.into(),
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
            status: ActionStatus::Pending,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status != ActionStatus::Pending
    }
}
