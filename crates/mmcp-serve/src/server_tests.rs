use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mmcp_config::{
    BackendTransport, EndpointConfig, GatewayConfig, MemberStatus, NamespaceConfig,
    NamespaceMember, RuntimeSettings, ServerConfig,
};
use mmcp_pool::{BackendConnector, ClientPool, ConnectContext, Connect, StderrLogStore};
use mmcp_proxy::{
    ConfigOverrideProvider, FingerprintTracker, MiddlewareChain, OverrideProvider, ProxyServices,
    TimeoutPolicy,
};
use mmcp_session::{LifetimeManager, SessionStore};
use rmcp::model::CallToolRequestParam;

use super::{EndpointServer, GatewayState};
use crate::auth::StaticKeyResolver;

const MATH_BACKEND: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"math","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"add","description":"add","inputSchema":{"type":"object","properties":{}}},{"name":"sub","description":"sub","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      name=$(printf '%s\n' "$line" | sed -n 's/.*"name"[ ]*:[ ]*"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"called:%s"}]}}\n' "$id" "$name"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

fn write_script(dir: &std::path::Path, body: &str) -> Result<std::path::PathBuf> {
    let path = dir.join("mock-mcp.sh");
    fs::write(&path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

struct Harness {
    server: EndpointServer,
    state: Arc<GatewayState>,
    _temp: tempfile::TempDir,
}

async fn start_gateway(session_lifetime: Option<Duration>) -> Result<Harness> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path(), MATH_BACKEND)?;

    let config = GatewayConfig {
        servers: vec![ServerConfig {
            uuid: "srv-math".to_string(),
            name: "math".to_string(),
            transport: BackendTransport::Stdio {
                command: "sh".to_string(),
                args: vec![script.to_string_lossy().into_owned()],
                env: HashMap::new(),
            },
            static_headers: HashMap::new(),
            forward_headers: Vec::new(),
            bearer_token: None,
            oauth_access_token: None,
            max_attempts: None,
        }],
        namespaces: vec![NamespaceConfig {
            uuid: "ns-1".to_string(),
            name: "default".to_string(),
            servers: vec![NamespaceMember {
                server_uuid: "srv-math".to_string(),
                status: MemberStatus::Active,
            }],
        }],
        endpoints: vec![EndpointConfig {
            name: "public".to_string(),
            namespace_uuid: "ns-1".to_string(),
        }],
        overrides: Vec::new(),
    };

    let settings = RuntimeSettings::default();
    let log_store = StderrLogStore::new(200);
    let ctx = ConnectContext::new(settings.clone(), Arc::clone(&log_store))
        .with_retry_backoff(Duration::from_millis(50));
    let config = Arc::new(config);
    let provider = ConfigOverrideProvider::new(Arc::clone(&config));

    let services = Arc::new(ProxyServices {
        pool: ClientPool::new(BackendConnector::new(ctx)),
        config,
        middleware: MiddlewareChain::standard(
            Arc::clone(&provider) as Arc<dyn OverrideProvider>,
            false,
        ),
        overrides: provider,
        catalog: None,
        fingerprints: FingerprintTracker::new(),
        timeouts: TimeoutPolicy::from(&settings),
    });

    let state = GatewayState::new(
        services,
        SessionStore::new(),
        LifetimeManager::new(session_lifetime),
        StaticKeyResolver::new(
            [("key-1".to_string(), "client-a".to_string())].into(),
            HashMap::new(),
        ),
        None,
        log_store,
    );

    let server = EndpointServer::start(Arc::clone(&state), "127.0.0.1:0".parse()?).await?;
    Ok(Harness {
        server,
        state,
        _temp: temp,
    })
}

/// Dial the gateway's own SSE endpoint the way any MCP client would; the
/// backend connector doubles as that client.
fn upstream_client_config(addr: std::net::SocketAddr) -> ServerConfig {
    ServerConfig {
        uuid: "upstream".to_string(),
        name: "gateway".to_string(),
        transport: BackendTransport::Sse {
            url: format!("http://{addr}/public/sse"),
        },
        static_headers: [("X-API-Key".to_string(), "key-1".to_string())].into(),
        forward_headers: Vec::new(),
        bearer_token: None,
        oauth_access_token: None,
        max_attempts: None,
    }
}

fn upstream_connector() -> Arc<BackendConnector> {
    BackendConnector::new(
        ConnectContext::new(RuntimeSettings::default(), StderrLogStore::new(50))
            .with_retry_backoff(Duration::from_millis(50)),
    )
}

#[tokio::test]
async fn unknown_endpoint_and_bad_credentials_are_rejected() -> Result<()> {
    let harness = start_gateway(None).await?;
    let base = format!("http://{}", harness.server.addr);
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{base}/public/sse"))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let response = http
        .get(format!("{base}/nope/sse"))
        .header("X-API-Key", "key-1")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = http
        .post(format!("{base}/public/message?sessionId=ghost"))
        .header("X-API-Key", "key-1")
        .json(&serde_json::json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    harness.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sse_endpoint_serves_the_aggregated_namespace() -> Result<()> {
    let harness = start_gateway(None).await?;

    let connector = upstream_connector();
    let client = connector
        .connect(&upstream_client_config(harness.server.addr), &HashMap::new())
        .await
        .expect("upstream client should connect over SSE");

    let listed = client.peer().list_tools(None).await?;
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__add", "math__sub"]);

    let result = client
        .peer()
        .call_tool(CallToolRequestParam {
            name: "math__add".into(),
            arguments: Some(
                serde_json::json!({"x": 1, "y": 2})
                    .as_object()
                    .cloned()
                    .unwrap_or_default(),
            ),
        })
        .await?;
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("called:add")
    );

    assert_eq!(harness.state.sessions.len().await, 1);
    assert_eq!(harness.state.sse.len().await, 1);

    client.close().await;

    // Teardown is asynchronous; poll until the session is gone.
    for _ in 0..40 {
        if harness.state.sessions.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(harness.state.sessions.is_empty().await);

    harness.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn session_lifetime_expiry_tears_the_session_down() -> Result<()> {
    let harness = start_gateway(Some(Duration::from_millis(300))).await?;

    let connector = upstream_connector();
    let client = connector
        .connect(&upstream_client_config(harness.server.addr), &HashMap::new())
        .await
        .expect("upstream client should connect over SSE");

    let listed = client.peer().list_tools(None).await?;
    assert_eq!(listed.tools.len(), 2);
    assert_eq!(harness.state.sessions.len().await, 1);

    // Wait past the lifetime; the manager cancels the connection and the
    // teardown path drops session state and pooled clients.
    for _ in 0..60 {
        if harness.state.sessions.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(harness.state.sessions.is_empty().await);
    assert_eq!(harness.state.sse.len().await, 0);
    assert!(harness.state.services.pool.is_empty().await);

    client.close().await;
    harness.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn admin_status_reports_liveness_and_counts() -> Result<()> {
    let harness = start_gateway(None).await?;
    let base = format!("http://{}", harness.server.addr);
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{base}/admin/status"))
        .header("X-API-Key", "key-1")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await?;
    assert_eq!(body["running"], true);
    assert_eq!(body["endpoints"], serde_json::json!(["public"]));
    assert_eq!(body["sessions"], 0);
    assert_eq!(body["pooledClients"], 0);
    // No supervisor configured, so no container summary.
    assert!(body["containers"].is_null());

    // A live session shows up in the counts.
    let connector = upstream_connector();
    let client = connector
        .connect(&upstream_client_config(harness.server.addr), &HashMap::new())
        .await
        .expect("upstream client should connect over SSE");
    let _ = client.peer().list_tools(None).await?;

    let body: serde_json::Value = http
        .get(format!("{base}/admin/status"))
        .header("X-API-Key", "key-1")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(body["sessions"], 1);
    assert_eq!(body["sseSessions"], 1);
    assert_eq!(body["pooledClients"], 1);

    client.close().await;
    harness.server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn admin_logs_endpoint_serves_the_stderr_ring() -> Result<()> {
    let harness = start_gateway(None).await?;
    harness.state.log_store.push("srv-math", "backend said hi");

    let base = format!("http://{}", harness.server.addr);
    let http = reqwest::Client::new();

    let response = http
        .get(format!("{base}/admin/servers/srv-math/logs?n=10"))
        .header("X-API-Key", "key-1")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = response.json().await?;
    let lines = body["lines"].as_array().unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].as_str().unwrap().ends_with("backend said hi"));

    // Container retry without a supervisor is a config conflict.
    let response = http
        .post(format!("{base}/admin/servers/srv-math/retry"))
        .header("X-API-Key", "key-1")
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);

    harness.server.shutdown().await;
    Ok(())
}
