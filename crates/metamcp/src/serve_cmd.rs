use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use mmcp_config::{GatewayConfig, RuntimeSettings};
use mmcp_container::{
    ContainerStateStore, ContainerSupervisor, DockerCli, MemoryStateStore, SupervisorConfig,
};
use mmcp_pool::{
    BackendConnector, ClientPool, ConnectContext, McpClientPool, StderrLogStore,
};
use mmcp_proxy::{
    ConfigOverrideProvider, FingerprintTracker, MemoryCatalog, MiddlewareChain, OverrideProvider,
    ProxyServices, TimeoutPolicy, ToolCatalog,
};
use mmcp_serve::{AuthResolver, EndpointServer, GatewayState, OpenResolver, StaticKeyResolver};
use mmcp_session::{LifetimeManager, SessionStore};

pub struct ServeArgs {
    pub config: std::path::PathBuf,
    pub bind: String,
    pub port: u16,
    pub containers: bool,
    pub container_image: Option<String>,
    pub container_network: Option<String>,
    pub api_keys: Vec<String>,
    pub no_middleware_cache: bool,
}

pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = GatewayConfig::load_from_path(&args.config)?;
    let settings = RuntimeSettings::from_env();
    let log_store = StderrLogStore::with_default_capacity();

    let supervisor = if args.containers {
        let mut supervisor_config = SupervisorConfig::default();
        if let Some(image) = args.container_image.clone() {
            supervisor_config.image = image;
        }
        supervisor_config.network = args.container_network.clone();
        let supervisor = ContainerSupervisor::new(
            DockerCli::new(),
            MemoryStateStore::new() as Arc<dyn ContainerStateStore>,
            supervisor_config,
        );
        supervisor.start();
        Some(supervisor)
    } else {
        None
    };

    // The crash hook needs the pool, and the pool needs the connector the
    // hook rides in; a OnceLock breaks the cycle.
    let pool_slot: Arc<OnceLock<Arc<McpClientPool>>> = Arc::new(OnceLock::new());
    let hook_slot = Arc::clone(&pool_slot);

    let mut ctx = ConnectContext::new(settings.clone(), Arc::clone(&log_store))
        .with_crash_callback(Arc::new(move |server_uuid, exit_code| {
            tracing::warn!(server = %server_uuid, exit_code = ?exit_code, "backend crashed");
            if let Some(pool) = hook_slot.get() {
                let pool = Arc::clone(pool);
                let server_uuid = server_uuid.to_string();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        pool.remove(&server_uuid).await;
                    });
                }
            }
        }));
    if let Some(supervisor) = &supervisor {
        ctx = ctx.with_error_probe(Arc::clone(supervisor) as _);
    }

    let pool = ClientPool::new(BackendConnector::new(ctx));
    let _ = pool_slot.set(Arc::clone(&pool));

    if let Some(supervisor) = &supervisor {
        for server in config.servers.iter().filter(|server| server.is_stdio()) {
            if let Err(error) = supervisor.create_container(server).await {
                tracing::warn!(server = %server.name, error = %error, "container pre-creation failed");
            }
        }
    }

    let config = Arc::new(config);
    let provider = ConfigOverrideProvider::new(Arc::clone(&config));
    let services = Arc::new(ProxyServices {
        pool: Arc::clone(&pool),
        config: Arc::clone(&config),
        middleware: MiddlewareChain::standard(
            Arc::clone(&provider) as Arc<dyn OverrideProvider>,
            args.no_middleware_cache,
        ),
        overrides: provider,
        catalog: Some(MemoryCatalog::new() as Arc<dyn ToolCatalog>),
        fingerprints: FingerprintTracker::new(),
        timeouts: TimeoutPolicy::from(&settings),
    });

    let sessions = SessionStore::new();
    let eviction = sessions.spawn_eviction_task();
    let lifetimes = LifetimeManager::new(settings.session_lifetime);
    let auth = build_auth(&args.api_keys)?;

    let state = GatewayState::new(
        services,
        Arc::clone(&sessions),
        Arc::clone(&lifetimes),
        auth,
        supervisor.clone(),
        log_store,
    );

    let bind: SocketAddr = format!("{}:{}", args.bind, args.port)
        .parse()
        .with_context(|| format!("invalid bind address '{}:{}'", args.bind, args.port))?;
    let server = EndpointServer::start(Arc::clone(&state), bind).await?;

    tracing::info!(addr = %server.addr, "metamcp gateway listening");
    for endpoint in &config.endpoints {
        println!(
            "endpoint '{}' (namespace {}): http://{}/{}/sse | http://{}/{}/mcp",
            endpoint.name,
            endpoint.namespace_uuid,
            server.addr,
            endpoint.name,
            server.addr,
            endpoint.name
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    server.shutdown().await;
    lifetimes.close_all().await;
    eviction.cancel();
    pool.cleanup_all().await;
    if let Some(supervisor) = &supervisor {
        supervisor.shutdown().await;
    }

    Ok(())
}

pub fn run_check(config_path: &Path) -> Result<()> {
    let config = GatewayConfig::load_from_path(config_path)?;
    println!(
        "ok: {} servers, {} namespaces, {} endpoints, {} overrides",
        config.servers.len(),
        config.namespaces.len(),
        config.endpoints.len(),
        config.overrides.len()
    );
    Ok(())
}

fn build_auth(api_keys: &[String]) -> Result<Arc<dyn AuthResolver>> {
    if api_keys.is_empty() {
        return Ok(Arc::new(OpenResolver));
    }

    let mut keys = HashMap::new();
    for pair in api_keys {
        let (key, client_id) = pair
            .split_once('=')
            .with_context(|| format!("invalid --api-key '{pair}', expected KEY=CLIENT"))?;
        keys.insert(key.to_string(), client_id.to_string());
    }
    Ok(StaticKeyResolver::new(keys, HashMap::new()))
}
