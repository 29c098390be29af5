use anyhow::Result;
use futures::future::join_all;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use microagent::errors::FederationError;
use microagent::federation::ToolFederation;
use microagent::session::local::LocalTransport;
use microagent::session::TransportKind;
use microagent::tool::{Terminate, Tool};

fn terminate_server() -> Box<LocalTransport> {
    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(Terminate)];
    Box::new(LocalTransport::new(tools))
}

#[tokio::test]
async fn test_concurrent_connects_get_distinct_ids() -> Result<()> {
    let federation = Arc::new(ToolFederation::new());
    let attaches = (0..4).map(|_| {
        let federation = federation.clone();
        async move {
            federation
                .attach(None, TransportKind::Local, terminate_server())
                .await
        }
    });
    let ids = join_all(attaches)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, FederationError>>()?;

    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), 4);
    assert_eq!(federation.tool_count().await, 4);
    assert!(federation.refresh().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_resolve_and_call_through_namespace() -> Result<()> {
    let federation = ToolFederation::new();
    federation
        .attach(Some("tools"), TransportKind::Local, terminate_server())
        .await?;

    let (session, original) = federation
        .resolve("tools_terminate")
        .await
        .expect("registered tool");
    assert_eq!(session.server_id(), "tools");
    assert_eq!(original, "terminate");

    let output = federation
        .call("tools_terminate", json!({"status": "failure"}))
        .await?;
    assert_eq!(
        output.to_string(),
        "The interaction has been completed with status: failure"
    );

    let descriptors = federation.tools().await;
    assert_eq!(descriptors[0].namespaced_name, "tools_terminate");
    assert_eq!(descriptors[0].server_id, "tools");
    Ok(())
}

#[tokio::test]
async fn test_disconnect_then_shutdown() -> Result<()> {
    let federation = ToolFederation::new();
    let first = federation
        .attach(None, TransportKind::Local, terminate_server())
        .await?;
    let second = federation
        .attach(None, TransportKind::Local, terminate_server())
        .await?;
    assert_eq!(federation.default_server().await, Some(first.clone()));

    federation.disconnect(&first).await;
    federation.disconnect(&first).await;
    assert_eq!(federation.default_server().await, Some(second.clone()));
    assert!(federation.resolve(&format!("{}_terminate", first)).await.is_none());

    federation.disconnect_all().await;
    assert!(federation.shutdown(Duration::from_secs(1)).await.is_empty());
    assert_eq!(federation.default_server().await, None);
    Ok(())
}
