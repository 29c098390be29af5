use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{LlmError, ProviderError};
use crate::models::message::Message;
use crate::models::tool::ToolSchema;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// How the model may pick tools for a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    None,
    #[default]
    Auto,
    Required,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolChoice::None => "none",
            ToolChoice::Auto => "auto",
            ToolChoice::Required => "required",
        }
    }
}

impl fmt::Display for ToolChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolChoice {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(ToolChoice::None),
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Required),
            other => Err(LlmError::Validation(format!(
                "Invalid tool_choice: {}",
                other
            ))),
        }
    }
}

/// One chat-completions request, already merged and formatted for the target model
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: Option<ToolChoice>,
    pub temperature: Option<f32>,
    pub max_tokens: u32,
    /// Reasoning models take `max_completion_tokens` and no temperature
    pub reasoning: bool,
}

#[derive(Debug, Clone)]
pub struct Completion {
    /// None when the response carried no choices
    pub message: Option<Message>,
    pub usage: Option<TokenUsage>,
}

pub type ChunkStream = BoxStream<'static, Result<String, ProviderError>>;

/// Base trait for chat-completions providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Generate the next message, optionally with tool calls
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ProviderError>;

    /// Stream the text deltas of a plain completion
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError>;
}
