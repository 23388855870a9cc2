//! Assistant, thread and message records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;
use crate::provider::ToolDefinition;
use crate::types::{GenerationSettings, ModelMessage};

/// A tool an assistant may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssistantTool {
    CodeInterpreter,
    WebSearch,
    FileSearch,
    DelegateResearch,
    /// Executed by the caller through an action.
    Function { function: ToolDefinition },
}

impl AssistantTool {
    pub fn function(definition: ToolDefinition) -> Self {
        Self::Function {
            function: definition,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::CodeInterpreter => "code_interpreter",
            Self::WebSearch => "web_search",
            Self::FileSearch => "file_search",
            Self::DelegateResearch => "delegate_research",
            Self::Function { function } => &function.name,
        }
    }

    /// Platform tools run inline; functions go out to the caller.
    pub fn is_platform(&self) -> bool {
        !matches!(self, Self::Function { .. })
    }
}

/// Assistant configuration in plain structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// `provider:model` id.
    pub model: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub tools: Vec<AssistantTool>,
    #[serde(default)]
    pub settings: GenerationSettings,
}

impl AssistantConfig {
    pub fn new(model: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            id: new_id("asst"),
            name: None,
            model: model.into(),
            instructions: instructions.into(),
            tools: Vec::new(),
            settings: GenerationSettings::default(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<AssistantTool>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn tool(&self, name: &str) -> Option<&AssistantTool> {
        self.tools.iter().find(|tool| tool.name() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            id: new_id("thread"),
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// A message persisted on a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadMessage {
    pub id: String,
    pub thread_id: String,
    /// Run that produced it, for assistant and tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub message: ModelMessage,
    pub created_at: DateTime<Utc>,
}

impl ThreadMessage {
    pub fn new(thread_id: impl Into<String>, run_id: Option<String>, message: ModelMessage) -> Self {
        Self {
            id: new_id("msg"),
            thread_id: thread_id.into(),
            run_id,
            message,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assistant_tools_use_tagged_json() {
        let tools: Vec<AssistantTool> = serde_json::from_value(json!([
            {"type": "code_interpreter"},
            {"type": "function", "function": {"name": "lookup", "parameters": {"type": "object"}}}
        ]))
        .unwrap();
        assert_eq!(tools[0].name(), "code_interpreter");
        assert!(tools[0].is_platform());
        assert_eq!(tools[1].name(), "lookup");
        assert!(!tools[1].is_platform());
    }
}
