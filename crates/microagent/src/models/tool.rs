use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool schema offered to the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    /// The name of the tool, namespaced when it comes from a federation
    pub name: String,
    /// A description of what the tool does
    pub description: String,
    /// JSON schema for the arguments the tool accepts
    pub input_schema: Value,
}

impl ToolSchema {
    pub fn new<N, D>(name: N, description: D, input_schema: Value) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        ToolSchema {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// A tool call requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    /// The name of the tool to execute
    pub name: String,
    /// The arguments for the execution, a JSON object
    pub arguments: Value,
}

impl ToolCall {
    pub fn new<I: Into<String>, S: Into<String>>(id: I, name: S, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A tool exposed by the federation, with its origin
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub namespaced_name: String,
    pub server_id: String,
    pub original_name: String,
    pub description: String,
    pub schema: Value,
}

impl ToolDescriptor {
    pub fn namespace(server_id: &str, original_name: &str) -> String {
        format!("{}_{}", server_id, original_name)
    }

    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema::new(
            self.namespaced_name.clone(),
            self.description.clone(),
            self.schema.clone(),
        )
    }
}
