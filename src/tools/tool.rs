//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;

use super::arguments::ToolArguments;
use super::types::{tool_definition, AgentToolParameters};
use crate::error::TurnstileError;
use crate::provider::ToolDefinition;
use crate::run::Orchestrator;

/// What a platform tool does. Delegated sub-runs only receive `Research` tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCategory {
    Research,
    CodeExecution,
    Delegation,
}

/// Context available during tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionContext {
    pub run_id: String,
    pub thread_id: String,
    pub call_id: String,
    /// `provider:model` id of the assistant that issued the call.
    pub model: String,
    /// Set when the tool runs inside an orchestrated run.
    pub orchestrator: Option<Orchestrator>,
}

/// A tool the platform executes inline.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters(&self) -> &AgentToolParameters;

    fn category(&self) -> ToolCategory;

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value, TurnstileError>;

    fn definition(&self) -> ToolDefinition {
        tool_definition(self.name(), self.description(), self.parameters())
    }
}

type ToolHandler = dyn Fn(
        ToolArguments,
        ToolExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, TurnstileError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool, handy for overriding a built-in.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: AgentToolParameters,
    category: ToolCategory,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: AgentToolParameters,
        category: ToolCategory,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, TurnstileError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            category,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &AgentToolParameters {
        &self.parameters
    }

    fn category(&self) -> ToolCategory {
        self.category
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value, TurnstileError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("category", &self.category)
            .finish()
    }
}
