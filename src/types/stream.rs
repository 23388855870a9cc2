//! Streaming types: raw upstream fragments in, canonical events out.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::generation::FinishReason;
use super::usage::Usage;
use crate::error::TurnstileError;

/// One unit of upstream output before normalization.
///
/// Text-channel backends put everything in `Text` and rely on inline markers;
/// backends with structured streaming use the dedicated variants.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFragment {
    /// Incremental text, possibly containing inline reasoning/tool markers.
    Text(String),
    /// Text from a native reasoning channel.
    Reasoning(String),
    /// Structured tool-call delta, keyed by the backend's call index.
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// End-of-generation marker.
    Finish {
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
}

/// Stream of raw fragments from one upstream call.
pub type RawStream = BoxStream<'static, Result<RawFragment, TurnstileError>>;

/// Kind of failure reported through a canonical `error` event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamErrorKind {
    Upstream,
    MalformedToolCall,
    Timeout,
    Storage,
}

/// Backend-agnostic unit of streamed output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    Content {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCallFragment {
        call_id: String,
        partial_json: String,
    },
    ToolCallComplete {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    Error {
        kind: StreamErrorKind,
        message: String,
    },
}

impl CanonicalEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into() }
    }

    pub fn error(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// Merge adjacent content, reasoning, and same-call fragment events.
///
/// Two streams that differ only in where the upstream split its chunks
/// coalesce to the same sequence.
pub fn coalesce_events(events: &[CanonicalEvent]) -> Vec<CanonicalEvent> {
    let mut out: Vec<CanonicalEvent> = Vec::with_capacity(events.len());
    for event in events {
        match (out.last_mut(), event) {
            (Some(CanonicalEvent::Content { text }), CanonicalEvent::Content { text: next }) => {
                text.push_str(next);
            }
            (
                Some(CanonicalEvent::Reasoning { text }),
                CanonicalEvent::Reasoning { text: next },
            ) => {
                text.push_str(next);
            }
            (
                Some(CanonicalEvent::ToolCallFragment {
                    call_id,
                    partial_json,
                }),
                CanonicalEvent::ToolCallFragment {
                    call_id: next_id,
                    partial_json: next,
                },
            ) if call_id == next_id => {
                partial_json.push_str(next);
            }
            _ => out.push(event.clone()),
        }
    }
    out
}
