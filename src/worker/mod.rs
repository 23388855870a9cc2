//! Streaming worker: one model turn against one route.
//!
//! Loads the thread history, truncates it to the route's budget, streams the
//! upstream through the delta normalizer, and persists the assistant message
//! once the stream ends cleanly. Upstream failures never surface as `Err`;
//! they arrive as a terminal `error` event.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::context::{ContextBudget, Truncator};
use crate::error::TurnstileError;
use crate::models::ModelRoute;
use crate::normalize::{normalize, MarkerNormalizer};
use crate::provider::{ModelProvider, ProviderRequest, ToolDefinition};
use crate::store::{Store, ThreadMessage};
use crate::types::{
    AgentToolCall, CanonicalEvent, GenerationSettings, ModelMessage, RawStream, StreamErrorKind,
};
use crate::util::retry::RetryPolicy;

/// Cached handle for one `provider:model` pair.
pub type ProviderHandle = Arc<StreamingWorker>;

/// One model turn on a thread.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub run_id: String,
    pub thread_id: String,
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
    pub settings: GenerationSettings,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub idle_timeout: Duration,
    pub max_tool_call_bytes: usize,
    pub threshold_percent: u8,
    pub reserve_output_tokens: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            max_tool_call_bytes: crate::normalize::DEFAULT_MAX_TOOL_CALL_BYTES,
            threshold_percent: 80,
            reserve_output_tokens: 4096,
        }
    }
}

/// Holds no per-call state, so one handle serves concurrent runs.
pub struct StreamingWorker {
    route: ModelRoute,
    provider: Arc<dyn ModelProvider>,
    store: Arc<dyn Store>,
    truncator: Truncator,
    options: WorkerOptions,
}

impl std::fmt::Debug for StreamingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingWorker")
            .field("route", &self.route.cache_key())
            .field("provider", &self.provider.provider_name())
            .finish()
    }
}

impl StreamingWorker {
    pub fn new(
        route: ModelRoute,
        provider: Arc<dyn ModelProvider>,
        store: Arc<dyn Store>,
        options: WorkerOptions,
    ) -> Self {
        let budget = ContextBudget::new(
            route
                .context_window
                .saturating_sub(options.reserve_output_tokens)
                .max(1),
            options.threshold_percent,
        );
        Self {
            route,
            provider,
            store,
            truncator: Truncator::new(budget),
            options,
        }
    }

    pub fn route(&self) -> &ModelRoute {
        &self.route
    }

    pub fn budget(&self) -> ContextBudget {
        self.truncator.budget()
    }

    /// Stream one model turn as canonical events.
    pub fn stream(&self, request: TurnRequest) -> BoxStream<'static, CanonicalEvent> {
        let provider = Arc::clone(&self.provider);
        let store = Arc::clone(&self.store);
        let truncator = self.truncator;
        let options = self.options;
        let markers = self.route.markers.clone();
        let model = self.route.cache_key();

        let stream = async_stream::stream! {
            let history = match store.list_messages(&request.thread_id).await {
                Ok(history) => history,
                Err(err) => {
                    yield CanonicalEvent::error(StreamErrorKind::Storage, err.to_string());
                    return;
                }
            };

            let mut messages = Vec::with_capacity(history.len() + 1);
            if !request.instructions.is_empty() {
                messages.push(ModelMessage::system(request.instructions.clone()));
            }
            messages.extend(history.into_iter().map(|m| m.message));
            let messages = truncator.truncate(&messages);

            let provider_request = ProviderRequest {
                messages,
                settings: request.settings.clone(),
                tools: (!request.tools.is_empty()).then(|| request.tools.clone()),
            };

            debug!(run_id = %request.run_id, %model, "starting model turn");
            let raw = match provider.stream(&provider_request).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(run_id = %request.run_id, %model, error = %err, "upstream failed to open");
                    yield CanonicalEvent::error(StreamErrorKind::Upstream, err.to_string());
                    return;
                }
            };

            let normalizer = MarkerNormalizer::new(markers)
                .with_max_tool_call_bytes(options.max_tool_call_bytes);
            let mut events = normalize(with_idle_timeout(raw, options.idle_timeout), Box::new(normalizer));

            let mut text = String::new();
            let mut calls: Vec<AgentToolCall> = Vec::new();
            let mut failed = false;
            while let Some(event) = events.next().await {
                match &event {
                    CanonicalEvent::Content { text: chunk } => text.push_str(chunk),
                    CanonicalEvent::ToolCallComplete { call_id, name, arguments } => {
                        calls.push(AgentToolCall {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                        });
                    }
                    CanonicalEvent::Error { .. } => failed = true,
                    _ => {}
                }
                yield event;
            }

            if failed || (text.is_empty() && calls.is_empty()) {
                return;
            }

            let message = ThreadMessage::new(
                request.thread_id.clone(),
                Some(request.run_id.clone()),
                ModelMessage::assistant_with_tool_calls(text, calls),
            );
            let persisted = RetryPolicy::for_storage()
                .execute(|| store.append_message(message.clone()))
                .await;
            if let Err(err) = persisted {
                warn!(run_id = %request.run_id, error = %err, "failed to persist assistant message");
                yield CanonicalEvent::error(StreamErrorKind::Storage, err.to_string());
            }
        };
        stream.boxed()
    }
}

/// Fail the stream when the upstream goes quiet for longer than `idle`.
pub fn with_idle_timeout(mut raw: RawStream, idle: Duration) -> RawStream {
    let stream = async_stream::stream! {
        loop {
            match tokio::time::timeout(idle, raw.next()).await {
                Ok(Some(item)) => yield item,
                Ok(None) => break,
                Err(_) => {
                    yield Err(TurnstileError::Timeout(idle.as_millis() as u64));
                    break;
                }
            }
        }
    };
    stream.boxed()
}
