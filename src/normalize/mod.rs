//! Delta normalization: raw upstream fragments to canonical events.
//!
//! Backends differ in how they surface reasoning and tool calls. Some stream
//! structured deltas, others inline literal markers in the text channel. The
//! [`MarkerNormalizer`] handles both, driven by a per-backend [`MarkerTable`].

pub mod machine;
pub mod markers;

pub use machine::{MarkerNormalizer, DEFAULT_MAX_TOOL_CALL_BYTES};
pub use markers::{BackendFamily, MarkerPair, MarkerTable, ToolMarkers};

use futures::stream::BoxStream;
use futures::StreamExt;

use crate::error::TurnstileError;
use crate::types::{CanonicalEvent, FinishReason, RawStream, StreamErrorKind};

/// Incremental converter from raw fragments to canonical events.
///
/// `push` may buffer; `finish` flushes whatever is left and reports an
/// unterminated tool call as an error.
pub trait NormalizeStream: Send {
    fn push(&mut self, fragment: crate::types::RawFragment) -> Vec<CanonicalEvent>;
    fn finish(&mut self) -> Vec<CanonicalEvent>;
    fn finish_reason(&self) -> Option<FinishReason>;
}

/// Drive `normalizer` over `raw`.
///
/// An upstream error becomes a terminal `error` event; the normalizer is not
/// flushed in that case since its buffered text belongs to an incomplete turn.
/// Nothing is emitted after the first error.
pub fn normalize(
    mut raw: RawStream,
    mut normalizer: Box<dyn NormalizeStream>,
) -> BoxStream<'static, CanonicalEvent> {
    let stream = async_stream::stream! {
        while let Some(item) = raw.next().await {
            match item {
                Ok(fragment) => {
                    let events = normalizer.push(fragment);
                    let failed = events.iter().any(CanonicalEvent::is_error);
                    for event in events {
                        yield event;
                    }
                    if failed {
                        return;
                    }
                }
                Err(err) => {
                    yield upstream_error_event(&err);
                    return;
                }
            }
        }
        for event in normalizer.finish() {
            yield event;
        }
    };
    stream.boxed()
}

fn upstream_error_event(err: &TurnstileError) -> CanonicalEvent {
    let kind = match err {
        TurnstileError::Timeout(_) => StreamErrorKind::Timeout,
        TurnstileError::MalformedToolCall(_) => StreamErrorKind::MalformedToolCall,
        _ => StreamErrorKind::Upstream,
    };
    CanonicalEvent::error(kind, err.to_string())
}
