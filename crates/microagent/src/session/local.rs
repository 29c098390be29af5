use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::transport::ToolTransport;
use crate::errors::{SessionError, ToolError};
use crate::models::tool::ToolSchema;
use crate::tool::{Tool, ToolOutput};

/// In-process transport serving `Tool` implementations
///
/// Clones share the same tool set, so a caller can keep a handle and change the tools while
/// a federation holds the transport.
#[derive(Clone, Default)]
pub struct LocalTransport {
    tools: Arc<RwLock<Vec<Arc<dyn Tool>>>>,
    closed: Arc<AtomicBool>,
}

impl LocalTransport {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            tools: Arc::new(RwLock::new(tools)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a tool, replacing any tool with the same name
    pub async fn add_tool(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.write().await;
        tools.retain(|t| t.name() != tool.name());
        tools.push(tool);
    }

    pub async fn remove_tool(&self, name: &str) {
        self.tools.write().await.retain(|t| t.name() != name);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ToolTransport for LocalTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, SessionError> {
        self.ensure_open()?;
        Ok(self.tools.read().await.iter().map(|t| t.to_schema()).collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, SessionError> {
        self.ensure_open()?;
        let tool = self
            .tools
            .read()
            .await
            .iter()
            .find(|t| t.name() == name)
            .cloned();
        let Some(tool) = tool else {
            return Ok(ToolOutput::error(
                ToolError::ToolNotFound(name.to_string()).to_string(),
            ));
        };

        debug!(tool = name, "executing local tool");
        Ok(match tool.execute(arguments).await {
            Ok(output) => output,
            Err(e) => ToolOutput::error(e.to_string()),
        })
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
