//! Platform tools executed inline by the orchestrator.
//!
//! `code_interpreter`, `web_search` and `file_search` are thin adapters over
//! collaborator traits so the sandbox, search engine and vector index stay
//! outside this crate. `delegate_research` hands its task to the delegation
//! subsystem through the orchestrator in the execution context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::delegation::DelegationRequest;
use crate::error::TurnstileError;
use crate::tools::tool::{AgentTool, Tool, ToolCategory, ToolExecutionContext};
use crate::tools::types::AgentToolParameters;

pub const CODE_INTERPRETER: &str = "code_interpreter";
pub const WEB_SEARCH: &str = "web_search";
pub const FILE_SEARCH: &str = "file_search";
pub const DELEGATE_RESEARCH: &str = "delegate_research";

const SANDBOX_OUTPUT_MAX_BYTES: usize = 32_768;
const SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SEARCH_RESULTS: u64 = 5;

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut cutoff = max_bytes;
    while cutoff > 0 && !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    s[..cutoff].to_string()
}

fn tool_error(tool: &str, message: impl Into<String>) -> TurnstileError {
    TurnstileError::ToolExecution {
        tool_name: tool.into(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Isolated code execution. Isolation itself is the implementor's concern.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(&self, language: &str, code: &str, timeout: Duration)
        -> Result<SandboxOutput, TurnstileError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, TurnstileError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub file_id: String,
    pub content: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn query(&self, query: &str, top_k: usize) -> Result<Vec<DocumentChunk>, TurnstileError>;
}

/// Runs snippets as local subprocesses in a scratch directory. Provides no
/// isolation beyond the working directory; use it for trusted setups only.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    workdir: PathBuf,
}

impl ProcessSandbox {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    fn command(language: &str) -> Option<(&'static str, &'static str)> {
        match language {
            "python" | "python3" => Some(("python3", "-c")),
            "sh" | "shell" | "bash" => Some(("sh", "-c")),
            _ => None,
        }
    }
}

#[async_trait]
impl CodeSandbox for ProcessSandbox {
    async fn run(
        &self,
        language: &str,
        code: &str,
        timeout: Duration,
    ) -> Result<SandboxOutput, TurnstileError> {
        let (program, flag) = Self::command(language)
            .ok_or_else(|| tool_error(CODE_INTERPRETER, format!("unsupported language '{language}'")))?;

        let result = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(program)
                .arg(flag)
                .arg(code)
                .current_dir(&self.workdir)
                .kill_on_drop(true)
                .output(),
        )
        .await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(tool_error(CODE_INTERPRETER, e.to_string())),
            Err(_) => {
                return Err(tool_error(
                    CODE_INTERPRETER,
                    format!("execution timed out after {}s", timeout.as_secs()),
                ))
            }
        };

        Ok(SandboxOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// `code_interpreter`: run a snippet in the sandbox and return its output.
pub fn code_interpreter_tool(sandbox: Arc<dyn CodeSandbox>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        CODE_INTERPRETER,
        "Execute a code snippet in an isolated sandbox and return stdout, stderr and exit code",
        AgentToolParameters::object()
            .string("code", "Source code to execute", true)
            .string_enum("language", "Language of the snippet", &["python", "sh"], false)
            .build(),
        ToolCategory::CodeExecution,
        move |args, _ctx: ToolExecutionContext| {
            let sandbox = Arc::clone(&sandbox);
            async move {
                let code = args.get_str("code")?;
                let language = args.get_str_opt("language").unwrap_or("python");
                let output = sandbox.run(language, code, SANDBOX_TIMEOUT).await?;

                let mut combined = format!("{}{}", output.stdout, output.stderr);
                let truncated = combined.len() > SANDBOX_OUTPUT_MAX_BYTES;
                if truncated {
                    combined = truncate_utf8(&combined, SANDBOX_OUTPUT_MAX_BYTES);
                    combined.push_str("\n... (truncated)");
                }
                Ok(json!({
                    "exit_code": output.exit_code,
                    "output": combined,
                    "truncated": truncated,
                }))
            }
        },
    ))
}

/// `web_search`: query the search backend.
pub fn web_search_tool(backend: Arc<dyn SearchBackend>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        WEB_SEARCH,
        "Search the web and return titles, URLs and snippets",
        AgentToolParameters::object()
            .string("query", "Search query", true)
            .integer("limit", "Maximum number of results", false)
            .build(),
        ToolCategory::Research,
        move |args, _ctx: ToolExecutionContext| {
            let backend = Arc::clone(&backend);
            async move {
                let query = args.get_str("query")?;
                let limit = args.get_u64_or("limit", DEFAULT_SEARCH_RESULTS) as usize;
                let hits = backend.search(query, limit).await?;
                Ok(json!({ "query": query, "results": hits }))
            }
        },
    ))
}

/// `file_search`: semantic lookup over the assistant's indexed files.
pub fn file_search_tool(index: Arc<dyn VectorIndex>) -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        FILE_SEARCH,
        "Search uploaded files for passages relevant to a query",
        AgentToolParameters::object()
            .string("query", "What to look for", true)
            .integer("top_k", "Number of passages to return", false)
            .build(),
        ToolCategory::Research,
        move |args, _ctx: ToolExecutionContext| {
            let index = Arc::clone(&index);
            async move {
                let query = args.get_str("query")?;
                let top_k = args.get_u64_or("top_k", DEFAULT_SEARCH_RESULTS) as usize;
                let chunks = index.query(query, top_k).await?;
                Ok(json!({ "query": query, "passages": chunks }))
            }
        },
    ))
}

/// `delegate_research`: run the task on an ephemeral sub-run and return its
/// final answer. A failure becomes an error tool result, so the parent run
/// carries on.
pub fn delegate_research_tool() -> Arc<dyn Tool> {
    Arc::new(AgentTool::new(
        DELEGATE_RESEARCH,
        "Hand a self-contained research task to a separate worker and return its final answer",
        AgentToolParameters::object()
            .string("task", "The research task, stated completely", true)
            .string_array("constraints", "Requirements the answer must satisfy", false)
            .string("model", "Optional provider:model for the worker", false)
            .build(),
        ToolCategory::Delegation,
        |args, ctx: ToolExecutionContext| async move {
            let orchestrator = ctx
                .orchestrator
                .clone()
                .ok_or_else(|| tool_error(DELEGATE_RESEARCH, "no orchestrator in context"))?;
            let request = DelegationRequest {
                task: args.get_str("task")?.to_string(),
                constraints: args.get_str_list("constraints"),
                model: args.get_str_opt("model").map(str::to_string),
                parent_model: (!ctx.model.is_empty()).then(|| ctx.model.clone()),
            };

            let text = orchestrator.delegator().delegate(request).await?;
            Ok(json!(text))
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolArguments;

    struct FixedSearch;

    #[async_trait]
    impl SearchBackend for FixedSearch {
        async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, TurnstileError> {
            Ok((0..limit.min(2))
                .map(|i| SearchHit {
                    title: format!("{query} #{i}"),
                    url: format!("https://example.test/{i}"),
                    snippet: String::new(),
                })
                .collect())
        }
    }

    struct EchoSandbox;

    #[async_trait]
    impl CodeSandbox for EchoSandbox {
        async fn run(&self, language: &str, code: &str, _timeout: Duration) -> Result<SandboxOutput, TurnstileError> {
            Ok(SandboxOutput {
                stdout: format!("{language}:{code}"),
                stderr: String::new(),
                exit_code: Some(0),
            })
        }
    }

    #[tokio::test]
    async fn web_search_passes_limit_through() {
        let tool = web_search_tool(Arc::new(FixedSearch));
        let args = ToolArguments::new(WEB_SEARCH, json!({"query": "rust", "limit": 1}));
        let out = tool.execute(&args, &ToolExecutionContext::default()).await.unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 1);
        assert_eq!(out["results"][0]["title"], "rust #0");
    }

    #[tokio::test]
    async fn code_interpreter_defaults_to_python() {
        let tool = code_interpreter_tool(Arc::new(EchoSandbox));
        let args = ToolArguments::new(CODE_INTERPRETER, json!({"code": "print(1)"}));
        let out = tool.execute(&args, &ToolExecutionContext::default()).await.unwrap();
        assert_eq!(out["output"], "python:print(1)");
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn process_sandbox_rejects_unknown_language() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessSandbox::new(dir.path())
            .run("cobol", "DISPLAY 1", SANDBOX_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnstileError::ToolExecution { .. }));
    }

    #[tokio::test]
    async fn process_sandbox_runs_shell() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessSandbox::new(dir.path())
            .run("sh", "echo hello", SANDBOX_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn delegation_without_orchestrator_is_an_error() {
        let tool = delegate_research_tool();
        let args = ToolArguments::new(DELEGATE_RESEARCH, json!({"task": "t"}));
        assert!(tool.execute(&args, &ToolExecutionContext::default()).await.is_err());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_utf8("héllo", 2), "h");
        assert_eq!(truncate_utf8("abc", 10), "abc");
    }

    #[test]
    fn categories() {
        assert_eq!(delegate_research_tool().category(), ToolCategory::Delegation);
        assert_eq!(web_search_tool(Arc::new(FixedSearch)).category(), ToolCategory::Research);
    }
}
