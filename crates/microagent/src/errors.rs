use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a single tool execution
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ToolResult<T> = Result<T, ToolError>;

/// Errors reported by a chat-completions provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Bad request {status}: {message}")]
    BadRequest { status: u16, message: String },

    #[error("Context length exceeded. Message: {0}")]
    ContextLengthExceeded(String),

    #[error("Could not decode response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ProviderError::BadRequest { .. } | ProviderError::ContextLengthExceeded(_)
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Request(err.to_string())
        }
    }
}

/// Errors surfaced by the model client
#[derive(Error, Debug)]
pub enum LlmError {
    #[error(
        "Request may exceed input token limit (current: {used}, needed: {requested}, maximum: {max})"
    )]
    TokenLimitExceeded { used: u64, requested: u64, max: u64 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Empty or invalid response from LLM")]
    EmptyResponse,

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl LlmError {
    /// Whether the retry policy may attempt the call again
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::TokenLimitExceeded { .. } | LlmError::Validation(_) => false,
            LlmError::EmptyResponse => true,
            LlmError::Provider(err) => err.is_retryable(),
        }
    }
}

/// Errors from a single tool server connection
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Session is closed")]
    Closed,
}

/// Errors from the multi-server tool registry
#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Failed to connect server '{server_id}': {reason}")]
    Connect { server_id: String, reason: String },

    #[error("Failed to disconnect server '{server_id}': {reason}")]
    Disconnect { server_id: String, reason: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' failed: {source}")]
    Call {
        tool: String,
        #[source]
        source: SessionError,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Tool message references unknown tool call id '{0}'")]
    UnknownToolCallId(String),

    #[error("Tool message is missing a tool call id")]
    MissingToolCallId,
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Cannot run agent from state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Federation(#[from] FederationError),

    #[error("Failed to render prompt: {0}")]
    Prompt(String),
}

pub type AgentResult<T> = Result<T, AgentError>;
