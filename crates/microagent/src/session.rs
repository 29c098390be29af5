pub mod local;
pub mod rmcp_transport;
pub mod transport;

use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::SessionError;
use crate::models::tool::ToolSchema;
use crate::tool::ToolOutput;
use rmcp_transport::RmcpTransport;
pub use transport::{ToolTransport, TransportKind, TransportSpec};

/// One live connection to one tool server
pub struct ToolSession {
    server_id: String,
    kind: TransportKind,
    transport: Box<dyn ToolTransport>,
    /// Last listing seen, keyed by original tool name
    known_tools: RwLock<BTreeMap<String, ToolSchema>>,
}

impl ToolSession {
    /// Open a remote server and take its first tool listing
    pub async fn connect(server_id: &str, spec: &TransportSpec) -> Result<Self, SessionError> {
        let transport = RmcpTransport::connect(spec).await?;
        Self::open(server_id, spec.kind(), Box::new(transport)).await
    }

    /// Wrap an already open transport and take its first tool listing
    ///
    /// The transport is closed again if the listing fails.
    pub async fn open(
        server_id: &str,
        kind: TransportKind,
        transport: Box<dyn ToolTransport>,
    ) -> Result<Self, SessionError> {
        let tools = match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    warn!(server_id, error = %close_err, "failed to release transport");
                }
                return Err(SessionError::Connect(e.to_string()));
            }
        };
        info!(server_id, %kind, tools = tools.len(), "tool session opened");

        Ok(Self {
            server_id: server_id.to_string(),
            kind,
            transport,
            known_tools: RwLock::new(
                tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            ),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// List the server's tools as they are right now
    pub async fn list_tools(&self) -> Result<Vec<ToolSchema>, SessionError> {
        self.transport.list_tools().await
    }

    pub async fn known_tools(&self) -> BTreeMap<String, ToolSchema> {
        self.known_tools.read().await.clone()
    }

    pub(crate) async fn set_known_tools(&self, tools: BTreeMap<String, ToolSchema>) {
        *self.known_tools.write().await = tools;
    }

    pub async fn call(&self, original_name: &str, arguments: Value) -> Result<ToolOutput, SessionError> {
        self.transport.call_tool(original_name, arguments).await
    }

    pub async fn close(&self) -> Result<(), SessionError> {
        self.known_tools.write().await.clear();
        self.transport.close().await
    }
}
