use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mmcp_config::{
    BackendTransport, EndpointConfig, GatewayConfig, MemberStatus, NamespaceConfig,
    NamespaceMember, RuntimeSettings, ServerConfig, ToolOverride,
};
use mmcp_pool::{BackendConnector, ClientPool, ConnectContext, StderrLogStore};
use rmcp::model::{CallToolRequestParam, GetPromptRequestParam, ReadResourceRequestParam};

use super::{ProxyServices, ProxySession};
use crate::catalog::{FingerprintTracker, MemoryCatalog, ToolCatalog};
use crate::middleware::{ConfigOverrideProvider, MiddlewareChain, OverrideProvider};
use crate::timeouts::TimeoutPolicy;

const NS: &str = "ns-1";

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
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"add","description":"add two numbers","inputSchema":{"type":"object","properties":{}}},{"name":"sub","description":"subtract","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
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

const WEATHER_BACKEND: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"weather!","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"now","description":"current weather","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
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

const FULL_BACKEND: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{},"prompts":{},"resources":{}},"serverInfo":{"name":"docs","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[]}}\n' "$id"
      ;;
    *\"prompts/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"prompts":[{"name":"greeting","description":"say hi"}]}}\n' "$id"
      ;;
    *\"prompts/get\"*)
      name=$(printf '%s\n' "$line" | sed -n 's/.*"name"[ ]*:[ ]*"\([^"]*\)".*/\1/p')
      printf '{"jsonrpc":"2.0","id":%s,"result":{"messages":[{"role":"user","content":{"type":"text","text":"prompt:%s"}}]}}\n' "$id" "$name"
      ;;
    *\"resources/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[{"uri":"file:///data.txt","name":"data"}]}}\n' "$id"
      ;;
    *\"resources/templates/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resourceTemplates":[{"uriTemplate":"file:///{name}.txt","name":"by-name"}]}}\n' "$id"
      ;;
    *\"resources/read\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"contents":[{"uri":"file:///data.txt","text":"hello"}]}}\n' "$id"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

// Reports this proxy's own unified name; must be dropped by the guard.
const SELF_BACKEND: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"metamcp-unified-ns-1","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"loop","description":"","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

// Two-page tool listing: the proxy must walk the cursor to the end.
const PAGED_BACKEND: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"paged","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"cursor\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"second","description":"","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"first","description":"","inputSchema":{"type":"object"}}],"nextCursor":"page-2"}}\n' "$id"
      ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

fn write_script(dir: &std::path::Path, file: &str, body: &str) -> Result<std::path::PathBuf> {
    let path = dir.join(file);
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

fn stdio_server(uuid: &str, name: &str, script: &std::path::Path) -> ServerConfig {
    ServerConfig {
        uuid: uuid.to_string(),
        name: name.to_string(),
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
    }
}

fn namespace_config(servers: Vec<ServerConfig>, overrides: Vec<ToolOverride>) -> GatewayConfig {
    let members = servers
        .iter()
        .map(|server| NamespaceMember {
            server_uuid: server.uuid.clone(),
            status: MemberStatus::Active,
        })
        .collect();

    GatewayConfig {
        servers,
        namespaces: vec![NamespaceConfig {
            uuid: NS.to_string(),
            name: "default".to_string(),
            servers: members,
        }],
        endpoints: vec![EndpointConfig {
            name: "public".to_string(),
            namespace_uuid: NS.to_string(),
        }],
        overrides,
    }
}

fn override_row(server_uuid: &str, original: &str, renamed: Option<&str>, enabled: bool) -> ToolOverride {
    ToolOverride {
        namespace_uuid: NS.to_string(),
        server_uuid: server_uuid.to_string(),
        original_name: original.to_string(),
        override_name: renamed.map(str::to_string),
        description_override: None,
        enabled,
    }
}

fn build_services(
    config: GatewayConfig,
    catalog: Option<Arc<MemoryCatalog>>,
) -> Arc<ProxyServices> {
    let settings = RuntimeSettings::default();
    let ctx = ConnectContext::new(settings.clone(), StderrLogStore::new(200))
        .with_retry_backoff(Duration::from_millis(50));
    let connector = BackendConnector::new(ctx);
    let config = Arc::new(config);
    let provider = ConfigOverrideProvider::new(Arc::clone(&config));

    Arc::new(ProxyServices {
        pool: ClientPool::new(connector),
        config,
        middleware: MiddlewareChain::standard(
            Arc::clone(&provider) as Arc<dyn OverrideProvider>,
            false,
        ),
        overrides: provider,
        catalog: catalog.map(|catalog| catalog as Arc<dyn ToolCatalog>),
        fingerprints: FingerprintTracker::new(),
        timeouts: TimeoutPolicy::from(&settings),
    })
}

fn session(services: &Arc<ProxyServices>) -> ProxySession {
    ProxySession::new(Arc::clone(services), NS, "sess-1", HashMap::new())
}

fn call(name: &str) -> CallToolRequestParam {
    CallToolRequestParam {
        name: name.to_string().into(),
        arguments: Some(
            serde_json::json!({"x": 1, "y": 2})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        ),
    }
}

async fn shutdown(services: &Arc<ProxyServices>) {
    services.pool.cleanup_all().await;
}

#[tokio::test]
async fn list_mangles_names_and_call_routes_with_original_name() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let weather = write_script(temp.path(), "weather.sh", WEATHER_BACKEND)?;

    let services = build_services(
        namespace_config(
            vec![
                stdio_server("srv-math", "math", &math),
                stdio_server("srv-weather", "weather!", &weather),
            ],
            Vec::new(),
        ),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__add", "math__sub", "weather__now"]);

    let result = proxy.call_tool_internal(call("math__add")).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("called:add")
    );

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn override_renames_in_listing_and_rewrites_calls() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let weather = write_script(temp.path(), "weather.sh", WEATHER_BACKEND)?;

    let services = build_services(
        namespace_config(
            vec![
                stdio_server("srv-math", "math", &math),
                stdio_server("srv-weather", "weather!", &weather),
            ],
            vec![override_row("srv-math", "add", Some("plus"), true)],
        ),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__plus", "math__sub", "weather__now"]);

    let result = proxy.call_tool_internal(call("math__plus")).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("called:add")
    );

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn disabled_tool_is_hidden_and_denied() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let weather = write_script(temp.path(), "weather.sh", WEATHER_BACKEND)?;

    let services = build_services(
        namespace_config(
            vec![
                stdio_server("srv-math", "math", &math),
                stdio_server("srv-weather", "weather!", &weather),
            ],
            vec![override_row("srv-weather", "now", None, false)],
        ),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__add", "math__sub"]);

    let result = proxy.call_tool_internal(call("weather__now")).await.unwrap();
    assert_eq!(result.is_error, Some(true));
    let text = result.content[0].as_text().map(|t| t.text.as_str()).unwrap();
    assert!(text.starts_with("Access denied to tool \"weather__now\""));

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn one_failing_backend_does_not_poison_the_listing() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let broken = write_script(temp.path(), "broken.sh", "#!/bin/sh\nexit 1\n")?;

    let services = build_services(
        namespace_config(
            vec![
                stdio_server("srv-math", "math", &math),
                stdio_server("srv-broken", "broken", &broken),
            ],
            Vec::new(),
        ),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__add", "math__sub"]);

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn catalog_sync_fires_only_when_the_name_set_changes() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let catalog = MemoryCatalog::new();

    let services = build_services(
        namespace_config(vec![stdio_server("srv-math", "math", &math)], Vec::new()),
        Some(Arc::clone(&catalog)),
    );
    let proxy = session(&services);

    proxy.list_tools_internal().await.unwrap();
    assert_eq!(catalog.upsert_calls(), 1);
    assert_eq!(catalog.names_for("srv-math").await, vec!["add", "sub"]);

    // Identical set: fingerprint unchanged, no second write.
    proxy.list_tools_internal().await.unwrap();
    assert_eq!(catalog.upsert_calls(), 1);

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn unknown_tools_are_rejected() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;

    let services = build_services(
        namespace_config(vec![stdio_server("srv-math", "math", &math)], Vec::new()),
        None,
    );
    let proxy = session(&services);

    let error = proxy.call_tool_internal(call("math__nope")).await.unwrap_err();
    assert!(error.message.contains("Unknown tool"));

    let error = proxy.call_tool_internal(call("noprefix")).await.unwrap_err();
    assert!(error.message.contains("Unknown tool"));

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn call_without_prior_listing_resolves_dynamically() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;

    let services = build_services(
        namespace_config(vec![stdio_server("srv-math", "math", &math)], Vec::new()),
        None,
    );
    let proxy = session(&services);

    // No tools/list ran, so the routing table is empty; the proxy must
    // rediscover the owner by prefix.
    let result = proxy.call_tool_internal(call("math__sub")).await.unwrap();
    assert_eq!(
        result.content[0].as_text().map(|t| t.text.as_str()),
        Some("called:sub")
    );

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn downstream_pagination_is_exhausted() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let paged = write_script(temp.path(), "paged.sh", PAGED_BACKEND)?;

    let services = build_services(
        namespace_config(vec![stdio_server("srv-paged", "paged", &paged)], Vec::new()),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["paged__first", "paged__second"]);

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn self_referential_backend_is_dropped_after_initialize() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let math = write_script(temp.path(), "math.sh", MATH_BACKEND)?;
    let selfish = write_script(temp.path(), "selfish.sh", SELF_BACKEND)?;

    let services = build_services(
        namespace_config(
            vec![
                stdio_server("srv-math", "math", &math),
                // Innocent static params; only the reported server name gives
                // the recursion away.
                stdio_server("srv-self", "inner-gateway", &selfish),
            ],
            Vec::new(),
        ),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_tools_internal().await.unwrap();
    let names: Vec<&str> = listed.tools.iter().map(|tool| tool.name.as_ref()).collect();
    assert_eq!(names, vec!["math__add", "math__sub"]);

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn prompts_are_mangled_and_fetched_by_original_name() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let docs = write_script(temp.path(), "docs.sh", FULL_BACKEND)?;

    let services = build_services(
        namespace_config(vec![stdio_server("srv-docs", "docs", &docs)], Vec::new()),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_prompts_internal().await.unwrap();
    assert_eq!(listed.prompts.len(), 1);
    assert_eq!(listed.prompts[0].name, "docs__greeting");

    let fetched = proxy
        .get_prompt_internal(GetPromptRequestParam {
            name: "docs__greeting".to_string().into(),
            arguments: None,
        })
        .await
        .unwrap();
    assert_eq!(fetched.messages.len(), 1);

    shutdown(&services).await;
    Ok(())
}

#[tokio::test]
async fn resources_route_by_uri() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let docs = write_script(temp.path(), "docs.sh", FULL_BACKEND)?;

    let services = build_services(
        namespace_config(vec![stdio_server("srv-docs", "docs", &docs)], Vec::new()),
        None,
    );
    let proxy = session(&services);

    let listed = proxy.list_resources_internal().await.unwrap();
    assert_eq!(listed.resources.len(), 1);
    assert_eq!(listed.resources[0].uri, "file:///data.txt");

    // Read without a prior list exercises the on-miss refresh.
    let fresh = session(&services);
    let contents = fresh
        .read_resource_internal(ReadResourceRequestParam {
            uri: "file:///data.txt".to_string().into(),
        })
        .await
        .unwrap();
    assert_eq!(contents.contents.len(), 1);

    let error = fresh
        .read_resource_internal(ReadResourceRequestParam {
            uri: "file:///missing.txt".to_string().into(),
        })
        .await
        .unwrap_err();
    assert!(error.message.contains("Unknown resource"));

    let templates = proxy.list_resource_templates_internal().await.unwrap();
    assert_eq!(templates.resource_templates.len(), 1);

    shutdown(&services).await;
    Ok(())
}
