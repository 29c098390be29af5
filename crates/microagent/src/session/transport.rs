use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use crate::errors::SessionError;
use crate::models::tool::ToolSchema;
use crate::tool::ToolOutput;

/// How a tool server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Sse,
    /// Tools hosted in this process
    Local,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::Sse => "sse",
            TransportKind::Local => "local",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to open a remote tool server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportSpec {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
    },
}

impl TransportSpec {
    pub fn stdio<C: Into<String>>(command: C, args: Vec<String>) -> Self {
        TransportSpec::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn sse<U: Into<String>>(url: U) -> Self {
        TransportSpec::Sse { url: url.into() }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            TransportSpec::Stdio { .. } => TransportKind::Stdio,
            TransportSpec::Sse { .. } => TransportKind::Sse,
        }
    }
}

/// A live connection that can list and call the tools of one server
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, SessionError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, SessionError>;

    /// Release the connection; calling it again is a no-op
    async fn close(&self) -> Result<(), SessionError>;
}
