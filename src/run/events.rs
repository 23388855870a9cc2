//! Run event stream types.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::types::RunStatus;
use crate::types::CanonicalEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunEventPayload {
    /// Normalized model output, forwarded in production order.
    Event { event: CanonicalEvent },
    /// The run entered `status`.
    Status { status: RunStatus },
}

/// Envelope for streamed run events. `seq` is gap-free per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn canonical(&self) -> Option<&CanonicalEvent> {
        match &self.payload {
            RunEventPayload::Event { event } => Some(event),
            RunEventPayload::Status { .. } => None,
        }
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self.payload {
            RunEventPayload::Status { status } => Some(status),
            RunEventPayload::Event { .. } => None,
        }
    }
}

/// Stamps and sends events for one run. A dropped receiver does not stop
/// the run; later events are discarded.
pub(crate) struct RunEventEmitter {
    run_id: String,
    seq: AtomicU64,
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl RunEventEmitter {
    pub(crate) fn new(run_id: impl Into<String>, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        Self {
            run_id: run_id.into(),
            seq: AtomicU64::new(0),
            tx,
        }
    }

    fn emit(&self, payload: RunEventPayload) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(RunEvent {
            run_id: self.run_id.clone(),
            seq,
            timestamp: Utc::now(),
            payload,
        });
    }

    pub(crate) fn event(&self, event: CanonicalEvent) {
        self.emit(RunEventPayload::Event { event });
    }

    pub(crate) fn status(&self, status: RunStatus) {
        self.emit(RunEventPayload::Status { status });
    }
}
