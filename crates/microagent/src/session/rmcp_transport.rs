//! MCP client transports built on `rmcp`
//!
//! Results are converted through their JSON form so the rest of the crate never depends on
//! the `rmcp` model types directly.

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::{SseClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::transport::{ToolTransport, TransportSpec};
use crate::errors::SessionError;
use crate::models::tool::ToolSchema;
use crate::tool::ToolOutput;

type ClientService = RunningService<RoleClient, ()>;

pub const NO_OUTPUT: &str = "No output returned.";

pub struct RmcpTransport {
    service: Mutex<Option<Arc<ClientService>>>,
}

impl RmcpTransport {
    /// Open the connection described by `spec` and complete the MCP handshake
    pub async fn connect(spec: &TransportSpec) -> Result<Self, SessionError> {
        let service = match spec {
            TransportSpec::Stdio { command, args, env } => {
                Self::serve_stdio(command, args, env).await?
            }
            TransportSpec::Sse { url } => Self::serve_sse(url).await?,
        };
        Ok(Self {
            service: Mutex::new(Some(Arc::new(service))),
        })
    }

    async fn serve_stdio(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ClientService, SessionError> {
        let mut cmd = Command::new(command);
        cmd.args(args).envs(env).kill_on_drop(true);

        info!(command, ?args, "spawning stdio tool server");
        let transport = TokioChildProcess::new(cmd)
            .map_err(|e| SessionError::Connect(format!("failed to spawn '{}': {}", command, e)))?;
        ().serve(transport)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))
    }

    async fn serve_sse(url: &str) -> Result<ClientService, SessionError> {
        info!(url, "connecting to sse tool server");
        let transport = SseClientTransport::start(url.to_string())
            .await
            .map_err(|e| SessionError::Connect(format!("failed to open '{}': {}", url, e)))?;
        ().serve(transport)
            .await
            .map_err(|e| SessionError::Connect(e.to_string()))
    }

    async fn service(&self) -> Result<Arc<ClientService>, SessionError> {
        self.service.lock().await.clone().ok_or(SessionError::Closed)
    }
}

#[async_trait]
impl ToolTransport for RmcpTransport {
    async fn list_tools(&self) -> Result<Vec<ToolSchema>, SessionError> {
        let service = self.service().await?;
        let tools = service
            .peer()
            .list_all_tools()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        tools
            .into_iter()
            .map(|tool| {
                serde_json::to_value(tool)
                    .map(|value| tool_from_json(&value))
                    .map_err(|e| SessionError::Transport(e.to_string()))
            })
            .collect()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput, SessionError> {
        let service = self.service().await?;
        let arguments = match arguments {
            Value::Null => json!({}),
            Value::Object(_) => arguments,
            other => {
                return Ok(ToolOutput::error(format!(
                    "Invalid parameters: expected a JSON object, got {}",
                    other
                )))
            }
        };
        let param: CallToolRequestParam =
            serde_json::from_value(json!({ "name": name, "arguments": arguments }))
                .map_err(|e| SessionError::Transport(e.to_string()))?;

        debug!(tool = name, "calling remote tool");
        let result = service
            .peer()
            .call_tool(param)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let value =
            serde_json::to_value(result).map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(output_from_json(&value))
    }

    async fn close(&self) -> Result<(), SessionError> {
        let Some(service) = self.service.lock().await.take() else {
            return Ok(());
        };
        match Arc::try_unwrap(service) {
            Ok(service) => {
                service
                    .cancel()
                    .await
                    .map_err(|e| SessionError::Transport(e.to_string()))?;
            }
            // A call is still in flight; cancelling the token tears the service down
            Err(shared) => shared.cancellation_token().cancel(),
        }
        Ok(())
    }
}

/// Read a tool listing entry in MCP wire form
pub fn tool_from_json(value: &Value) -> ToolSchema {
    ToolSchema::new(
        value["name"].as_str().unwrap_or_default(),
        value["description"].as_str().unwrap_or_default(),
        value
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(|| json!({"type": "object"})),
    )
}

/// Read a tool call result in MCP wire form
///
/// Text parts are joined with ", ", the last image part becomes the inline image and an
/// `isError` result is reported as an error output.
pub fn output_from_json(value: &Value) -> ToolOutput {
    let mut texts = Vec::new();
    let mut image = None;
    for item in value["content"].as_array().into_iter().flatten() {
        match item["type"].as_str() {
            Some("text") => {
                if let Some(text) = item["text"].as_str() {
                    texts.push(text.to_string());
                }
            }
            Some("image") => image = item["data"].as_str().map(str::to_string),
            _ => {}
        }
    }

    let text = if texts.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        texts.join(", ")
    };
    let mut output = if value["isError"].as_bool().unwrap_or(false) {
        ToolOutput::error(text)
    } else {
        ToolOutput::text(text)
    };
    output.base64_image = image;
    output
}
