//! Error types for Turnstile.

pub mod unified;

pub use unified::{ErrorCategory, RecoverySuggestion, RunError, RunErrorCode};

use thiserror::Error;

/// Primary error type for all Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The model id does not resolve through the route table. Bad configuration; never retried.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Backend disconnect, 5xx, or an unreadable stream payload.
    #[error("Upstream stream error: {0}")]
    UpstreamStream(String),

    /// Accumulated tool-call text never parsed before the size cap or end of stream.
    #[error("Malformed tool call: {0}")]
    MalformedToolCall(String),

    /// Pending actions were not resolved within the poll cap.
    #[error("Timed out waiting for tool outputs after {waited_ms}ms")]
    ActionTimeout { waited_ms: u64 },

    /// An ephemeral sub-run did not complete.
    #[error("Delegation failed: {0}")]
    DelegationFailure(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Thread {thread_id} already has an active run ({run_id})")]
    ThreadBusy { thread_id: String, run_id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },
}

impl TurnstileError {
    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a not-found error for a record kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownModel(_) | Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) | Self::UpstreamStream(_) => ErrorCategory::Network,
            Self::Timeout(_) | Self::ActionTimeout { .. } => ErrorCategory::Timeout,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::MalformedToolCall(_) => ErrorCategory::Protocol,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::ToolExecution { .. } | Self::DelegationFailure(_) => {
                ErrorCategory::ToolExecution
            }
            Self::Cache(_) | Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::NotFound { .. }
            | Self::ThreadBusy { .. }
            | Self::InvalidState(_)
            | Self::InvalidArgument(_) => ErrorCategory::Request,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
                | ErrorCategory::Storage
        ) && !matches!(self, Self::ActionTimeout { .. })
    }

    /// Suggest recovery actions.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self.category() {
            ErrorCategory::Authentication => RecoverySuggestion::CheckCredentials,
            ErrorCategory::RateLimit | ErrorCategory::Network | ErrorCategory::Server => {
                RecoverySuggestion::RetryWithBackoff
            }
            ErrorCategory::Timeout => RecoverySuggestion::IncreaseTimeout,
            ErrorCategory::Configuration => RecoverySuggestion::CheckConfiguration,
            ErrorCategory::ToolExecution => RecoverySuggestion::CheckToolImplementation,
            ErrorCategory::Protocol => RecoverySuggestion::StartNewRun,
            _ => RecoverySuggestion::ContactSupport,
        }
    }

    /// Structured, persistable form of this error for `Run::last_error`.
    pub fn to_run_error(&self) -> RunError {
        let code = match self {
            Self::UnknownModel(_) => RunErrorCode::UnknownModel,
            Self::UpstreamStream(_)
            | Self::Network(_)
            | Self::Api { .. }
            | Self::RateLimited { .. }
            | Self::Authentication(_)
            | Self::Timeout(_) => RunErrorCode::UpstreamStream,
            Self::MalformedToolCall(_) => RunErrorCode::MalformedToolCall,
            Self::ActionTimeout { .. } => RunErrorCode::ActionTimeout,
            Self::ToolExecution { .. } | Self::DelegationFailure(_) => RunErrorCode::ToolExecution,
            Self::Storage(_) | Self::Cache(_) | Self::Io(_) => RunErrorCode::Storage,
            _ => RunErrorCode::Internal,
        };
        RunError::new(code, self.to_string())
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, TurnstileError>;
