//! Platform tools available to runs, keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use super::builtin::{
    code_interpreter_tool, delegate_research_tool, file_search_tool, web_search_tool, CodeSandbox,
    SearchBackend, VectorIndex,
};
use super::tool::{Tool, ToolCategory, ToolExecutionContext};
use super::validation::validate_arguments;
use super::ToolArguments;
use crate::error::TurnstileError;
use crate::provider::ToolDefinition;
use crate::store::AssistantTool;

/// Outcome of running a platform tool, ready to become a tool-result message.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub result: Value,
    pub is_error: bool,
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

impl ToolRegistry {
    /// Registry with `delegate_research` only; the others need a collaborator.
    pub fn new() -> Self {
        Self::empty().with_tool(delegate_research_tool())
    }

    pub fn empty() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Add or replace a tool under its own name.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_code_sandbox(self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.with_tool(code_interpreter_tool(sandbox))
    }

    pub fn with_search_backend(self, backend: Arc<dyn SearchBackend>) -> Self {
        self.with_tool(web_search_tool(backend))
    }

    pub fn with_vector_index(self, index: Arc<dyn VectorIndex>) -> Self {
        self.with_tool(file_search_tool(index))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Platform tool kinds whose implementation is in the `category`.
    pub fn tools_in(&self, category: ToolCategory) -> Vec<AssistantTool> {
        let mut names: Vec<&str> = self
            .tools
            .values()
            .filter(|tool| tool.category() == category)
            .map(|tool| tool.name())
            .collect();
        names.sort_unstable();
        names.into_iter().filter_map(platform_tool).collect()
    }

    /// Provider-facing definitions for an assistant's declared tools.
    /// Platform tools without a registered implementation are left out.
    pub fn definitions_for(&self, declared: &[AssistantTool]) -> Vec<ToolDefinition> {
        declared
            .iter()
            .filter_map(|tool| match tool {
                AssistantTool::Function { function } => Some(function.clone()),
                platform => match self.get(platform.name()) {
                    Some(implementation) => Some(implementation.definition()),
                    None => {
                        warn!(tool = platform.name(), "declared platform tool is not registered");
                        None
                    }
                },
            })
            .collect()
    }

    /// Validate and run a platform tool. Failures become error results.
    pub async fn execute(&self, name: &str, arguments: Value, ctx: &ToolExecutionContext) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            return ToolOutcome {
                result: json!(format!("tool '{name}' is not available")),
                is_error: true,
            };
        };
        if let Err(err) = validate_arguments(name, &arguments, &tool.parameters().schema) {
            return ToolOutcome {
                result: json!(err.to_string()),
                is_error: true,
            };
        }
        match tool.execute(&ToolArguments::new(name, arguments), ctx).await {
            Ok(result) => ToolOutcome {
                result,
                is_error: false,
            },
            Err(err) => {
                warn!(tool = name, run_id = %ctx.run_id, error = %err, "platform tool failed");
                ToolOutcome {
                    result: json!(error_text(err)),
                    is_error: true,
                }
            }
        }
    }
}

fn error_text(err: TurnstileError) -> String {
    match err {
        TurnstileError::DelegationFailure(reason) => format!("delegation failed: {reason}"),
        other => other.to_string(),
    }
}

fn platform_tool(name: &str) -> Option<AssistantTool> {
    match name {
        "code_interpreter" => Some(AssistantTool::CodeInterpreter),
        "web_search" => Some(AssistantTool::WebSearch),
        "file_search" => Some(AssistantTool::FileSearch),
        "delegate_research" => Some(AssistantTool::DelegateResearch),
        _ => None,
    }
}
