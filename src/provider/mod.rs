//! Model provider trait and implementations.

pub mod http;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "ollama")]
pub mod ollama;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TurnstileConfig;
use crate::error::TurnstileError;
use crate::models::{BackendKind, ModelRoute};
use crate::types::{GenerationSettings, ModelMessage, RawStream};

/// A request sent to a model provider.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ModelMessage>,
    pub settings: GenerationSettings,
    pub tools: Option<Vec<ToolDefinition>>,
}

/// Tool definition sent to the provider API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Core trait implemented by all model providers.
///
/// `stream` fails only when the upstream cannot be opened. Once open,
/// failures arrive as `Err` items on the returned stream.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name (e.g., "openai", "ollama").
    fn provider_name(&self) -> &str;
    /// The model ID this provider instance serves.
    fn model_id(&self) -> &str;

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError>;
}

/// Builds providers for resolved routes.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, route: &ModelRoute) -> Result<Box<dyn ModelProvider>, TurnstileError>;
}

/// Factory for the built-in HTTP providers, reading credentials from config.
#[derive(Debug, Clone)]
pub struct HttpProviderFactory {
    config: TurnstileConfig,
}

impl HttpProviderFactory {
    pub fn new(config: TurnstileConfig) -> Self {
        Self { config }
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, route: &ModelRoute) -> Result<Box<dyn ModelProvider>, TurnstileError> {
        create_provider(route, &self.config)
    }
}

/// Create a provider for the given route, using the provided config.
///
/// Base URL precedence: config override for the provider, then the route's
/// own base URL, then the backend default.
#[allow(unused_variables)]
pub fn create_provider(
    route: &ModelRoute,
    config: &TurnstileConfig,
) -> Result<Box<dyn ModelProvider>, TurnstileError> {
    let base_url = config
        .get_base_url(&route.provider)
        .or_else(|| route.base_url.clone());
    let api_key = config.get_api_key(&route.provider);

    match route.backend {
        #[cfg(feature = "openai")]
        BackendKind::OpenAi => {
            let api_key = api_key.ok_or_else(|| {
                TurnstileError::Authentication(format!(
                    "Missing API key for provider '{}'",
                    route.provider
                ))
            })?;
            Ok(Box::new(openai::OpenAiProvider::new(
                route.upstream_model.clone(),
                Some(api_key),
                base_url,
            )))
        }
        #[cfg(feature = "openai")]
        BackendKind::OpenAiCompatible => {
            let base_url = base_url.ok_or_else(|| {
                TurnstileError::Configuration(format!(
                    "Missing base URL for provider '{}'",
                    route.provider
                ))
            })?;
            Ok(Box::new(openai::OpenAiProvider::compatible(
                route.provider.clone(),
                route.upstream_model.clone(),
                api_key,
                base_url,
            )))
        }
        #[cfg(feature = "anthropic")]
        BackendKind::Anthropic => {
            let api_key = api_key.ok_or_else(|| {
                TurnstileError::Authentication("Missing ANTHROPIC_API_KEY".into())
            })?;
            Ok(Box::new(anthropic::AnthropicProvider::new(
                route.upstream_model.clone(),
                api_key,
                base_url,
            )))
        }
        #[cfg(feature = "ollama")]
        BackendKind::Ollama => Ok(Box::new(ollama::OllamaProvider::new(
            route.upstream_model.clone(),
            base_url,
        ))),
        #[allow(unreachable_patterns)]
        other => Err(TurnstileError::Configuration(format!(
            "Backend '{other}' for '{}' is not enabled via feature flags",
            route.cache_key()
        ))),
    }
}
