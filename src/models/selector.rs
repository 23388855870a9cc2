//! Model selection and parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TurnstileError;

/// A parsed `provider:model` id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Parse a "provider:model" string into a [`ModelRef`].
pub struct ModelSelector;

impl ModelSelector {
    /// Parse "provider:model_id". Only the first colon splits, so model ids
    /// may contain colons themselves.
    ///
    /// Examples: "openai:gpt-4o", "ollama:qwen2.5:7b", "together:deepseek-ai/DeepSeek-R1"
    pub fn parse(s: &str) -> Result<ModelRef, TurnstileError> {
        let (provider, model) = s.split_once(':').ok_or_else(|| {
            TurnstileError::UnknownModel(format!("'{s}': expected 'provider:model'"))
        })?;
        let provider = provider.trim();
        let model = model.trim();
        if provider.is_empty() || model.is_empty() {
            return Err(TurnstileError::UnknownModel(format!(
                "'{s}': provider and model must be non-empty"
            )));
        }
        Ok(ModelRef {
            provider: provider.to_ascii_lowercase(),
            model: model.to_string(),
        })
    }
}

impl FromStr for ModelRef {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelSelector::parse(s)
    }
}
