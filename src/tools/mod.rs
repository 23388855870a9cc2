//! Platform tools and the collaborator traits behind them.

pub mod arguments;
pub mod builtin;
pub mod registry;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use builtin::{
    CodeSandbox, DocumentChunk, ProcessSandbox, SandboxOutput, SearchBackend, SearchHit,
    VectorIndex,
};
pub use registry::{ToolOutcome, ToolRegistry};
pub use tool::{AgentTool, Tool, ToolCategory, ToolExecutionContext};
pub use types::AgentToolParameters;
