//! Ollama local provider (OpenAI-compatible).

use async_trait::async_trait;

use crate::error::TurnstileError;
use crate::types::RawStream;

use super::openai::OpenAiProvider;
use super::{ModelProvider, ProviderRequest};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    inner: OpenAiProvider,
}

impl OllamaProvider {
    pub fn new(model: impl Into<String>, base_url: Option<String>) -> Self {
        let base_url = base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            inner: OpenAiProvider::compatible(
                "ollama",
                model,
                None, // no API key for local
                format!("{}/v1", base_url.trim_end_matches('/')),
            ),
        }
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<RawStream, TurnstileError> {
        self.inner.stream(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_v1_suffix() {
        let provider = OllamaProvider::new("qwen2.5", Some("http://gpu:11434/".into()));
        assert_eq!(provider.inner.base_url(), "http://gpu:11434/v1");
        assert_eq!(provider.model_id(), "qwen2.5");
    }
}
