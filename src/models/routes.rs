//! Two-level route table: provider prefix, then per-provider submodel table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::selector::ModelSelector;
use crate::error::TurnstileError;
use crate::normalize::{BackendFamily, MarkerTable};

/// Wildcard submodel key.
pub const WILDCARD: &str = "*";

const DEFAULT_CONTEXT_WINDOW: usize = 32_768;

/// Wire protocol spoken by an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum BackendKind {
    #[serde(rename = "openai")]
    #[strum(serialize = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    #[strum(serialize = "anthropic")]
    Anthropic,
    #[serde(rename = "ollama")]
    #[strum(serialize = "ollama")]
    Ollama,
    #[serde(rename = "openai-compatible")]
    #[strum(serialize = "openai-compatible")]
    OpenAiCompatible,
}

fn default_context_window() -> usize {
    DEFAULT_CONTEXT_WINDOW
}

/// Submodel table entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    #[serde(default)]
    pub family: BackendFamily,
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Model name sent upstream when it differs from the routed name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_model: Option<String>,
    /// Custom marker table; overrides the family's built-in table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<MarkerTable>,
}

impl RouteEntry {
    pub fn new(family: BackendFamily, context_window: usize) -> Self {
        Self {
            family,
            context_window,
            upstream_model: None,
            markers: None,
        }
    }

    pub fn with_upstream_model(mut self, model: impl Into<String>) -> Self {
        self.upstream_model = Some(model.into());
        self
    }
}

/// Routes for one provider prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRoutes {
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default)]
    pub models: HashMap<String, RouteEntry>,
}

impl ProviderRoutes {
    pub fn new(backend: BackendKind, base_url: Option<&str>) -> Self {
        Self {
            backend,
            base_url: base_url.map(str::to_string),
            models: HashMap::new(),
        }
    }

    pub fn with_model(mut self, name: impl Into<String>, entry: RouteEntry) -> Self {
        self.models.insert(name.into(), entry);
        self
    }

    /// Exact name, then the name without an Ollama-style `:tag`, then `*`.
    fn lookup(&self, model: &str) -> Option<&RouteEntry> {
        self.models
            .get(model)
            .or_else(|| {
                model
                    .split_once(':')
                    .and_then(|(base, _)| self.models.get(base))
            })
            .or_else(|| self.models.get(WILDCARD))
    }
}

/// Extra route from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteOverride {
    pub provider: String,
    pub model: String,
    /// Required when `provider` is not already in the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(flatten)]
    pub entry: RouteEntry,
}

/// A fully resolved route: everything needed to build a provider handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub provider: String,
    pub model: String,
    pub upstream_model: String,
    pub backend: BackendKind,
    pub base_url: Option<String>,
    pub family: BackendFamily,
    pub markers: MarkerTable,
    pub context_window: usize,
}

impl ModelRoute {
    /// Handle-cache key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.provider, self.model)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    providers: HashMap<String, ProviderRoutes>,
}

impl RouteTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in providers and the open-weight families served through them.
    pub fn builtin() -> Self {
        use BackendFamily::{DeepSeek, Hermes, Mistral, Native};

        let mut table = Self::empty();
        table.insert_provider(
            "openai",
            ProviderRoutes::new(BackendKind::OpenAi, None)
                .with_model(WILDCARD, RouteEntry::new(Native, 128_000)),
        );
        table.insert_provider(
            "anthropic",
            ProviderRoutes::new(BackendKind::Anthropic, None)
                .with_model(WILDCARD, RouteEntry::new(Native, 200_000)),
        );
        table.insert_provider(
            "groq",
            ProviderRoutes::new(
                BackendKind::OpenAiCompatible,
                Some("https://api.groq.com/openai/v1"),
            )
            .with_model(WILDCARD, RouteEntry::new(Native, 131_072)),
        );
        table.insert_provider(
            "openrouter",
            ProviderRoutes::new(
                BackendKind::OpenAiCompatible,
                Some("https://openrouter.ai/api/v1"),
            )
            .with_model(WILDCARD, RouteEntry::new(Native, 128_000)),
        );
        table.insert_provider(
            "together",
            ProviderRoutes::new(
                BackendKind::OpenAiCompatible,
                Some("https://api.together.xyz/v1"),
            )
            .with_model("deepseek-ai/DeepSeek-R1", RouteEntry::new(DeepSeek, 128_000))
            .with_model(WILDCARD, RouteEntry::new(Native, 128_000)),
        );
        table.insert_provider(
            "ollama",
            ProviderRoutes::new(BackendKind::Ollama, None)
                .with_model("qwen2.5", RouteEntry::new(Hermes, 32_768))
                .with_model("qwen3", RouteEntry::new(Hermes, 40_960))
                .with_model("hermes3", RouteEntry::new(Hermes, 131_072))
                .with_model("deepseek-r1", RouteEntry::new(DeepSeek, 131_072))
                .with_model("mistral", RouteEntry::new(Mistral, 32_768))
                .with_model("mistral-nemo", RouteEntry::new(Mistral, 131_072))
                .with_model(WILDCARD, RouteEntry::new(Native, DEFAULT_CONTEXT_WINDOW)),
        );
        table
    }

    pub fn insert_provider(&mut self, provider: impl Into<String>, routes: ProviderRoutes) {
        self.providers.insert(provider.into(), routes);
    }

    /// Add a configured route. New providers need an explicit backend.
    pub fn apply(&mut self, route: RouteOverride) -> Result<(), TurnstileError> {
        let provider = route.provider.to_ascii_lowercase();
        let routes = match self.providers.entry(provider) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let backend = route.backend.ok_or_else(|| {
                    TurnstileError::Configuration(format!(
                        "route for new provider '{}' needs a backend",
                        entry.key()
                    ))
                })?;
                entry.insert(ProviderRoutes::new(backend, None))
            }
        };
        if let Some(backend) = route.backend {
            routes.backend = backend;
        }
        if route.base_url.is_some() {
            routes.base_url = route.base_url;
        }
        routes.models.insert(route.model, route.entry);
        Ok(())
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// Resolve a `provider:model` id. Fails with `UnknownModel` when either level misses.
    pub fn resolve(&self, model_id: &str) -> Result<ModelRoute, TurnstileError> {
        let model_ref = ModelSelector::parse(model_id)?;
        let routes = self.providers.get(&model_ref.provider).ok_or_else(|| {
            TurnstileError::UnknownModel(format!(
                "{model_id}: no routes for provider '{}'",
                model_ref.provider
            ))
        })?;
        let entry = routes.lookup(&model_ref.model).ok_or_else(|| {
            TurnstileError::UnknownModel(format!(
                "{model_id}: provider '{}' has no route for '{}'",
                model_ref.provider, model_ref.model
            ))
        })?;

        Ok(ModelRoute {
            upstream_model: entry
                .upstream_model
                .clone()
                .unwrap_or_else(|| model_ref.model.clone()),
            backend: routes.backend,
            base_url: routes.base_url.clone(),
            family: entry.family,
            markers: entry
                .markers
                .clone()
                .unwrap_or_else(|| entry.family.markers()),
            context_window: entry.context_window,
            provider: model_ref.provider,
            model: model_ref.model,
        })
    }
}
