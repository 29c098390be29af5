use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::errors::{ToolError, ToolResult};
use crate::models::tool::ToolSchema;

/// The result of one tool execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64_image: Option<String>,
}

impl ToolOutput {
    pub fn text<S: Into<String>>(output: S) -> Self {
        Self {
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn error<S: Into<String>>(error: S) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_image<S: Into<String>>(mut self, base64_image: S) -> Self {
        self.base64_image = Some(base64_image.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.error, &self.output) {
            (Some(error), _) => write!(f, "Error: {}", error),
            (None, Some(output)) => f.write_str(output),
            (None, None) => Ok(()),
        }
    }
}

/// A capability that can be executed with JSON arguments
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments
    fn schema(&self) -> Value;

    async fn execute(&self, arguments: Value) -> ToolResult<ToolOutput>;

    fn to_schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), self.schema())
    }
}

/// Ends the interaction when the task is done or cannot proceed
pub struct Terminate;

#[async_trait]
impl Tool for Terminate {
    fn name(&self) -> &str {
        "terminate"
    }

    fn description(&self) -> &str {
        "Terminate the interaction when the request is met OR if the assistant cannot proceed \
         further with the task. When you have finished all the tasks, call this tool to end \
         the work."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "description": "The finish status of the interaction.",
                    "enum": ["success", "failure"]
                }
            },
            "required": ["status"]
        })
    }

    async fn execute(&self, arguments: Value) -> ToolResult<ToolOutput> {
        let status = arguments
            .get("status")
            .and_then(|s| s.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing 'status'".to_string()))?;
        Ok(ToolOutput::text(format!(
            "The interaction has been completed with status: {}",
            status
        )))
    }
}
