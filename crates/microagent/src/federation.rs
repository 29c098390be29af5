use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{FederationError, SessionError};
use crate::models::tool::{ToolDescriptor, ToolSchema};
use crate::providers::utils::sanitize_function_name;
use crate::session::{ToolSession, ToolTransport, TransportKind, TransportSpec};
use crate::tool::ToolOutput;

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Namespaced tool names affected by a refresh
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Default)]
struct Registry {
    /// Live sessions in connection order
    sessions: Vec<Arc<ToolSession>>,
    tools: BTreeMap<String, ToolDescriptor>,
    default_server: Option<String>,
    /// Ids handed out to connects that have not finished yet
    reserved: HashSet<String>,
}

impl Registry {
    fn in_use(&self, server_id: &str) -> bool {
        self.reserved.contains(server_id)
            || self.sessions.iter().any(|s| s.server_id() == server_id)
    }

    /// Register a server's tools, returning the namespaced names actually inserted
    fn insert_tools<'a>(
        &mut self,
        server_id: &str,
        tools: impl Iterator<Item = &'a ToolSchema>,
    ) -> BTreeSet<String> {
        let mut inserted = BTreeSet::new();
        for schema in tools {
            let namespaced = namespace(server_id, &schema.name);
            if let Some(existing) = self.tools.get(&namespaced) {
                warn!(
                    server_id,
                    tool = %schema.name,
                    namespaced = %namespaced,
                    owner = %existing.server_id,
                    taken_by = %existing.original_name,
                    "namespaced tool name already taken, skipping"
                );
                continue;
            }
            self.tools.insert(
                namespaced.clone(),
                ToolDescriptor {
                    namespaced_name: namespaced.clone(),
                    server_id: server_id.to_string(),
                    original_name: schema.name.clone(),
                    description: schema.description.clone(),
                    schema: schema.input_schema.clone(),
                },
            );
            inserted.insert(namespaced);
        }
        inserted
    }

    /// Namespaced names and schemas currently registered for a server
    fn server_tools(&self, server_id: &str) -> BTreeMap<String, Value> {
        self.tools
            .values()
            .filter(|d| d.server_id == server_id)
            .map(|d| (d.namespaced_name.clone(), d.schema.clone()))
            .collect()
    }

    fn remove_tools(&mut self, server_id: &str) {
        self.tools.retain(|_, d| d.server_id != server_id);
    }
}

/// `{server_id}_{tool}` restricted to characters model APIs accept
fn namespace(server_id: &str, original_name: &str) -> String {
    sanitize_function_name(&ToolDescriptor::namespace(server_id, original_name))
}

/// A registry of tool sessions exposing all their tools under namespaced names
pub struct ToolFederation {
    registry: RwLock<Registry>,
    pending_closes: Mutex<Vec<(String, JoinHandle<Result<(), SessionError>>)>>,
    close_timeout: Duration,
}

impl Default for ToolFederation {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolFederation {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            pending_closes: Mutex::new(Vec::new()),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    async fn reserve_id(
        &self,
        requested: Option<&str>,
        kind: TransportKind,
    ) -> Result<String, FederationError> {
        let mut registry = self.registry.write().await;
        let server_id = match requested {
            Some(id) if registry.in_use(id) => {
                return Err(FederationError::Connect {
                    server_id: id.to_string(),
                    reason: "server id already in use".to_string(),
                });
            }
            Some(id) => id.to_string(),
            None => {
                let mut ordinal = registry.sessions.len();
                loop {
                    let candidate = format!("{}_{}", kind, ordinal);
                    if !registry.in_use(&candidate) {
                        break candidate;
                    }
                    ordinal += 1;
                }
            }
        };
        registry.reserved.insert(server_id.clone());
        Ok(server_id)
    }

    async fn register(
        &self,
        server_id: String,
        opened: Result<ToolSession, SessionError>,
    ) -> Result<String, FederationError> {
        let mut registry = self.registry.write().await;
        registry.reserved.remove(&server_id);

        let session = match opened {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "failed to connect tool server");
                return Err(FederationError::Connect {
                    server_id,
                    reason: e.to_string(),
                });
            }
        };

        let known = session.known_tools().await;
        registry.insert_tools(&server_id, known.values());
        if registry.default_server.is_none() {
            registry.default_server = Some(server_id.clone());
        }
        registry.sessions.push(session);
        info!(server_id = %server_id, tools = known.len(), "tool server connected");
        Ok(server_id)
    }

    /// Connect a remote tool server, returning its server id
    pub async fn connect(
        &self,
        server_id: Option<&str>,
        spec: TransportSpec,
    ) -> Result<String, FederationError> {
        let server_id = self.reserve_id(server_id, spec.kind()).await?;
        let opened = ToolSession::connect(&server_id, &spec).await;
        self.register(server_id, opened).await
    }

    /// Register an already open transport, such as an in-process tool set
    pub async fn attach(
        &self,
        server_id: Option<&str>,
        kind: TransportKind,
        transport: Box<dyn ToolTransport>,
    ) -> Result<String, FederationError> {
        let server_id = self.reserve_id(server_id, kind).await?;
        let opened = ToolSession::open(&server_id, kind, transport).await;
        self.register(server_id, opened).await
    }

    /// Connect several servers concurrently; one failure does not affect the others
    pub async fn connect_many(
        &self,
        specs: Vec<(Option<String>, TransportSpec)>,
    ) -> Vec<Result<String, FederationError>> {
        join_all(
            specs
                .into_iter()
                .map(|(id, spec)| async move { self.connect(id.as_deref(), spec).await }),
        )
        .await
    }

    /// Re-list every session and apply the differences to the registry
    pub async fn refresh(&self) -> RefreshReport {
        let sessions = self.registry.read().await.sessions.clone();

        let mut listings = Vec::new();
        for session in sessions {
            match session.list_tools().await {
                Ok(tools) => listings.push((session, tools)),
                Err(e) => warn!(
                    server_id = session.server_id(),
                    error = %e,
                    "failed to refresh tools, keeping previous listing"
                ),
            }
        }

        let mut report = RefreshReport::default();
        let mut registry = self.registry.write().await;
        for (session, tools) in listings {
            // Skip sessions disconnected while we were listing
            if !registry.sessions.iter().any(|s| Arc::ptr_eq(s, &session)) {
                continue;
            }
            let server_id = session.server_id();
            let current: BTreeMap<String, ToolSchema> =
                tools.into_iter().map(|t| (t.name.clone(), t)).collect();

            let before = registry.server_tools(server_id);
            registry.remove_tools(server_id);
            let inserted = registry.insert_tools(server_id, current.values());

            for name in &inserted {
                let schema = registry.tools.get(name).map(|d| &d.schema);
                match before.get(name) {
                    None => report.added.push(name.clone()),
                    Some(old) if Some(old) != schema => report.changed.push(name.clone()),
                    Some(_) => {}
                }
            }
            report.removed.extend(
                before
                    .keys()
                    .filter(|name| !inserted.contains(*name))
                    .cloned(),
            );
            session.set_known_tools(current).await;
        }
        drop(registry);

        report.added.sort();
        report.removed.sort();
        report.changed.sort();
        if !report.added.is_empty() {
            info!(tools = ?report.added, "tools added");
        }
        if !report.removed.is_empty() {
            info!(tools = ?report.removed, "tools removed");
        }
        if !report.changed.is_empty() {
            info!(tools = ?report.changed, "tool schemas changed");
        }
        report
    }

    /// Remove a server and close it in the background; unknown ids are ignored
    pub async fn disconnect(&self, server_id: &str) {
        let session = {
            let mut registry = self.registry.write().await;
            let Some(position) = registry
                .sessions
                .iter()
                .position(|s| s.server_id() == server_id)
            else {
                debug!(server_id, "disconnect of unknown server ignored");
                return;
            };
            let session = registry.sessions.remove(position);
            registry.remove_tools(server_id);
            if registry.default_server.as_deref() == Some(server_id) {
                registry.default_server = registry
                    .sessions
                    .first()
                    .map(|s| s.server_id().to_string());
            }
            session
        };

        let timeout = self.close_timeout;
        let id = server_id.to_string();
        let handle = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, session.close()).await {
                Ok(result) => result,
                Err(_) => Err(SessionError::Transport(format!(
                    "close timed out after {:?}",
                    timeout
                ))),
            };
            match &result {
                Ok(()) => info!(server_id = %id, "tool server disconnected"),
                Err(e) => warn!(server_id = %id, error = %e, "failed to close tool server"),
            }
            result
        });
        self.pending_closes
            .lock()
            .await
            .push((server_id.to_string(), handle));
    }

    pub async fn disconnect_all(&self) {
        for server_id in self.server_ids().await {
            self.disconnect(&server_id).await;
        }
    }

    /// Wait for background closes to finish, reporting the ones that failed
    pub async fn shutdown(&self, grace: Duration) -> Vec<FederationError> {
        let handles = std::mem::take(&mut *self.pending_closes.lock().await);
        let mut errors = Vec::new();
        for (server_id, handle) in handles {
            let reason = match tokio::time::timeout(grace, handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(join_error)) => join_error.to_string(),
                Err(_) => format!("still closing after {:?}", grace),
            };
            errors.push(FederationError::Disconnect { server_id, reason });
        }
        errors
    }

    /// Find the session and original tool name behind a namespaced name
    pub async fn resolve(&self, namespaced: &str) -> Option<(Arc<ToolSession>, String)> {
        let registry = self.registry.read().await;
        let descriptor = registry.tools.get(namespaced)?;
        let session = registry
            .sessions
            .iter()
            .find(|s| s.server_id() == descriptor.server_id)?
            .clone();
        Some((session, descriptor.original_name.clone()))
    }

    pub async fn call(&self, namespaced: &str, arguments: Value) -> Result<ToolOutput, FederationError> {
        let (session, original) = self
            .resolve(namespaced)
            .await
            .ok_or_else(|| FederationError::UnknownTool(namespaced.to_string()))?;
        debug!(tool = namespaced, server_id = session.server_id(), "dispatching tool call");
        session
            .call(&original, arguments)
            .await
            .map_err(|source| FederationError::Call {
                tool: namespaced.to_string(),
                source,
            })
    }

    /// All tools, sorted by namespaced name
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.registry.read().await.tools.values().cloned().collect()
    }

    pub async fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .read()
            .await
            .tools
            .values()
            .map(|d| d.to_schema())
            .collect()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.registry.read().await.tools.keys().cloned().collect()
    }

    pub async fn tool_count(&self) -> usize {
        self.registry.read().await.tools.len()
    }

    pub async fn server_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .await
            .sessions
            .iter()
            .map(|s| s.server_id().to_string())
            .collect()
    }

    pub async fn default_server(&self) -> Option<String> {
        self.registry.read().await.default_server.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.registry.read().await.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ToolResult;
    use crate::session::local::LocalTransport;
    use crate::tool::Tool;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo {
        schema: Value,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                schema: json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            }
        }
    }

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text back"
        }

        fn schema(&self) -> Value {
            self.schema.clone()
        }

        async fn execute(&self, arguments: Value) -> ToolResult<ToolOutput> {
            Ok(ToolOutput::text(arguments["text"].as_str().unwrap_or_default()))
        }
    }

    /// A no-op tool with an arbitrary name
    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Does nothing"
        }

        fn schema(&self) -> Value {
            json!({"type": "object"})
        }

        async fn execute(&self, _arguments: Value) -> ToolResult<ToolOutput> {
            Ok(ToolOutput::text(self.0))
        }
    }

    fn local_echo() -> LocalTransport {
        LocalTransport::new(vec![Arc::new(Echo::new())])
    }

    async fn attach(federation: &ToolFederation, transport: LocalTransport) -> Result<String, FederationError> {
        federation
            .attach(None, TransportKind::Local, Box::new(transport))
            .await
    }

    #[tokio::test]
    async fn test_same_tool_on_two_servers() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        let first = attach(&federation, local_echo()).await?;
        let second = attach(&federation, local_echo()).await?;

        assert_eq!(first, "local_0");
        assert_eq!(second, "local_1");
        assert_eq!(
            federation.tool_names().await,
            vec!["local_0_echo".to_string(), "local_1_echo".to_string()]
        );

        let output = federation
            .call("local_1_echo", json!({"text": "hi"}))
            .await?;
        assert_eq!(output.output.as_deref(), Some("hi"));
        Ok(())
    }

    #[tokio::test]
    async fn test_collision_within_one_server_is_skipped() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        let handle = LocalTransport::new(vec![Arc::new(Named("a.b"))]);
        attach(&federation, handle.clone()).await?;
        assert_eq!(federation.tool_names().await, vec!["local_0_a_b".to_string()]);

        // `a_b` sanitizes to the same namespaced name as `a.b`
        handle.add_tool(Arc::new(Named("a_b"))).await;
        handle.add_tool(Arc::new(Named("c"))).await;
        let report = federation.refresh().await;
        assert_eq!(report.added, vec!["local_0_c".to_string()]);
        assert!(report.removed.is_empty());
        assert_eq!(federation.tool_count().await, 2);

        let (_, original) = federation
            .resolve("local_0_a_b")
            .await
            .ok_or_else(|| FederationError::UnknownTool("local_0_a_b".into()))?;
        assert_eq!(original, "a.b");
        Ok(())
    }

    #[tokio::test]
    async fn test_connect_then_refresh_reports_nothing() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        attach(&federation, local_echo()).await?;
        assert!(federation.refresh().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_reports_changes() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        let handle = local_echo();
        attach(&federation, handle.clone()).await?;

        handle.add_tool(Arc::new(crate::tool::Terminate)).await;
        handle
            .add_tool(Arc::new(Echo {
                schema: json!({"type": "object", "properties": {"message": {"type": "string"}}}),
            }))
            .await;
        let report = federation.refresh().await;
        assert_eq!(report.added, vec!["local_0_terminate".to_string()]);
        assert_eq!(report.changed, vec!["local_0_echo".to_string()]);
        assert!(report.removed.is_empty());

        handle.remove_tool("echo").await;
        let report = federation.refresh().await;
        assert_eq!(report.removed, vec!["local_0_echo".to_string()]);
        assert_eq!(federation.tool_names().await, vec!["local_0_terminate".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_relist_keeps_entries() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        let handle = local_echo();
        attach(&federation, handle.clone()).await?;

        // listing fails from now on
        let _ = handle.close().await;
        let report = federation.refresh().await;
        assert!(report.is_empty());
        assert_eq!(federation.tool_count().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_ids_and_default_server() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        federation
            .attach(Some("local_1"), TransportKind::Local, Box::new(local_echo()))
            .await?;
        let auto = attach(&federation, local_echo()).await?;
        assert_eq!(auto, "local_2");

        let duplicate = federation
            .attach(Some("local_1"), TransportKind::Local, Box::new(local_echo()))
            .await;
        assert!(matches!(duplicate, Err(FederationError::Connect { .. })));

        assert_eq!(federation.default_server().await.as_deref(), Some("local_1"));
        federation.disconnect("local_1").await;
        assert_eq!(federation.default_server().await.as_deref(), Some("local_2"));
        assert_eq!(federation.tool_names().await, vec!["local_2_echo".to_string()]);

        federation.disconnect("missing").await;
        assert_eq!(federation.server_ids().await, vec!["local_2".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_disconnect_closes_in_background() -> Result<(), FederationError> {
        let federation = ToolFederation::new();
        let first = local_echo();
        let second = local_echo();
        attach(&federation, first.clone()).await?;
        attach(&federation, second.clone()).await?;

        federation.disconnect_all().await;
        assert!(federation.is_empty().await);
        assert_eq!(federation.tool_count().await, 0);
        assert_eq!(federation.default_server().await, None);

        let errors = federation.shutdown(Duration::from_secs(1)).await;
        assert!(errors.is_empty());
        assert!(first.is_closed());
        assert!(second.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let federation = ToolFederation::new();
        let result = federation.call("nope_echo", json!({})).await;
        assert!(matches!(result, Err(FederationError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_registry_untouched() {
        let federation = ToolFederation::new();
        let results = federation
            .connect_many(vec![(
                None,
                TransportSpec::stdio("/nonexistent/microagent-tool-server", vec![]),
            )])
            .await;
        assert!(matches!(results[0], Err(FederationError::Connect { .. })));
        assert!(federation.is_empty().await);

        // the failed id is free again
        let ok = federation
            .attach(None, TransportKind::Stdio, Box::new(local_echo()))
            .await;
        assert_eq!(ok.ok().as_deref(), Some("stdio_0"));
    }
}
