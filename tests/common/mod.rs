//! Shared test helpers: scripted provider, counting factory, flaky cache and
//! a fully wired in-memory orchestrator.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;

use turnstile::arbiter::{ArbiterOptions, ProviderArbiter};
use turnstile::cache::FastCache;
use turnstile::error::TurnstileError;
use turnstile::models::{ModelRoute, RouteTable};
use turnstile::provider::{ModelProvider, ProviderFactory, ProviderRequest, ToolDefinition};
use turnstile::run::{Orchestrator, OrchestratorOptions, RunEvent};
use turnstile::store::{AssistantConfig, AssistantTool, InMemoryStore, Store, Thread, ThreadMessage};
use turnstile::tools::ToolRegistry;
use turnstile::types::{FinishReason, ModelMessage, RawFragment, RawStream};

/// Model id every harness assistant uses. Native family, so no inline markers.
pub const MODEL: &str = "openai:gpt-4o";

/// One scripted upstream response.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub items: Vec<Result<RawFragment, String>>,
    /// Delay before each item.
    pub delay: Duration,
    /// Never end after the items.
    pub hang: bool,
}

impl Script {
    pub fn new(fragments: Vec<RawFragment>) -> Self {
        Self {
            items: fragments.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(vec![RawFragment::Text(text.into()), finish(FinishReason::Stop)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn then_error(mut self, message: &str) -> Self {
        self.items.push(Err(message.into()));
        self
    }
}

pub fn finish(reason: FinishReason) -> RawFragment {
    RawFragment::Finish {
        finish_reason: Some(reason),
        usage: None,
    }
}

/// Complete native tool call in one delta.
pub fn tool_call(index: usize, id: &str, name: &str, arguments: serde_json::Value) -> RawFragment {
    RawFragment::ToolCallDelta {
        index,
        id: Some(id.into()),
        name: Some(name.into()),
        arguments: arguments.to_string(),
    }
}

/// Provider that replays queued scripts, one per `stream` call, and records
/// every request it receives.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::text("(no script)"));
        let stream = async_stream::stream! {
            for item in script.items {
                if !script.delay.is_zero() {
                    tokio::time::sleep(script.delay).await;
                }
                yield item.map_err(TurnstileError::UpstreamStream);
            }
            if script.hang {
                futures::future::pending::<()>().await;
            }
        };
        Ok(stream.boxed())
    }
}

struct Shared(Arc<ScriptedProvider>);

#[async_trait]
impl ModelProvider for Shared {
    fn provider_name(&self) -> &str {
        self.0.provider_name()
    }

    fn model_id(&self) -> &str {
        self.0.model_id()
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
        self.0.stream(request).await
    }
}

/// Factory handing out the same scripted provider, counting constructions.
pub struct CountingFactory {
    pub provider: Arc<ScriptedProvider>,
    builds: AtomicUsize,
}

impl CountingFactory {
    pub fn new(provider: Arc<ScriptedProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            builds: AtomicUsize::new(0),
        })
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl ProviderFactory for CountingFactory {
    fn create(&self, _route: &ModelRoute) -> Result<Box<dyn ModelProvider>, TurnstileError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
        Ok(Box::new(Shared(Arc::clone(&self.provider))))
    }
}

/// Fast cache whose every call fails, as if the backend were unreachable.
#[derive(Default)]
pub struct UnreachableCache {
    pub calls: AtomicUsize,
}

#[async_trait]
impl FastCache for UnreachableCache {
    async fn get(&self, _key: &str) -> Result<Option<String>, TurnstileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TurnstileError::Cache("connection refused".into()))
    }

    async fn set_with_ttl(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), TurnstileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TurnstileError::Cache("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<(), TurnstileError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(TurnstileError::Cache("connection refused".into()))
    }
}

pub fn fast_options() -> OrchestratorOptions {
    OrchestratorOptions {
        poll_interval: Duration::from_millis(50),
        max_poll_iterations: 20,
        ..OrchestratorOptions::default()
    }
}

/// In-memory store, scripted provider, arbiter and orchestrator wired together.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<ScriptedProvider>,
    pub factory: Arc<CountingFactory>,
    pub arbiter: Arc<ProviderArbiter>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ToolRegistry::new(), fast_options())
    }

    pub fn with(tools: ToolRegistry, options: OrchestratorOptions) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let provider = ScriptedProvider::new();
        let factory = CountingFactory::new(Arc::clone(&provider));
        let arbiter = Arc::new(ProviderArbiter::new(
            RouteTable::builtin(),
            factory.clone(),
            store.clone(),
            None,
            ArbiterOptions::default(),
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&arbiter), tools, options);
        Self {
            store,
            provider,
            factory,
            arbiter,
            orchestrator,
        }
    }

    pub async fn assistant(&self, tools: Vec<AssistantTool>) -> AssistantConfig {
        let assistant = AssistantConfig::new(MODEL, "You are terse.").with_tools(tools);
        self.store.create_assistant(assistant.clone()).await.unwrap();
        assistant
    }

    pub async fn thread(&self, user: &str) -> Thread {
        let thread = Thread::new();
        self.store.create_thread(thread.clone()).await.unwrap();
        self.store
            .append_message(ThreadMessage::new(&thread.id, None, ModelMessage::user(user)))
            .await
            .unwrap();
        thread
    }

    pub async fn messages(&self, thread_id: &str) -> Vec<ModelMessage> {
        self.store
            .list_messages(thread_id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect()
    }
}

pub fn lookup_tool() -> AssistantTool {
    AssistantTool::function(ToolDefinition {
        name: "lookup".into(),
        description: "Look something up".into(),
        parameters: json!({"type": "object", "properties": {"q": {"type": "string"}}}),
    })
}

/// Pull events until one matches `pred`, returning everything seen.
pub async fn events_until<F>(
    events: &mut turnstile::run::RunEventStream,
    mut pred: F,
) -> Vec<RunEvent>
where
    F: FnMut(&RunEvent) -> bool,
{
    let mut seen = Vec::new();
    while let Some(event) = events.next().await {
        let done = pred(&event);
        seen.push(event);
        if done {
            break;
        }
    }
    seen
}
