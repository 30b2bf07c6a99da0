use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mmcp_config::{GatewayConfig, ServerConfig};
use mmcp_pool::{ConnectedClient, McpClientPool};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, Prompt, PromptsCapability, ReadResourceRequestParam,
    ReadResourceResult, Resource, ResourceTemplate, ResourcesCapability, ServerCapabilities,
    ServerInfo, Tool, ToolsCapability,
};
use rmcp::service::{Peer, RequestContext, ServiceError};
use rmcp::{ErrorData as McpError, RoleClient, RoleServer, ServerHandler};
use tokio::sync::RwLock;

use crate::catalog::{CatalogTool, FingerprintTracker, ToolCatalog, filter_override_shadowed};
use crate::middleware::{CallDecision, MiddlewareChain, OverrideProvider};
use crate::naming::{mangle, sanitize, split_mangled};
use crate::timeouts::TimeoutPolicy;

/// Server name the proxy reports for a namespace; also what the
/// self-reference guard looks for after capability fetch.
pub fn unified_server_name(namespace_uuid: &str) -> String {
    format!("metamcp-unified-{namespace_uuid}")
}

/// Shared services one proxy session composes over.
pub struct ProxyServices {
    pub pool: Arc<McpClientPool>,
    pub config: Arc<GatewayConfig>,
    pub middleware: Arc<MiddlewareChain>,
    pub overrides: Arc<dyn OverrideProvider>,
    pub catalog: Option<Arc<dyn ToolCatalog>>,
    pub fingerprints: Arc<FingerprintTracker>,
    pub timeouts: TimeoutPolicy,
}

/// Per-backend context cloned into fan-out subtasks.
#[derive(Clone)]
struct BackendContext {
    services: Arc<ProxyServices>,
    namespace_uuid: String,
    session_id: String,
    candidate_headers: HashMap<String, String>,
}

impl BackendContext {
    async fn client_for(&self, server: &ServerConfig) -> Option<Arc<ConnectedClient>> {
        let client = self
            .services
            .pool
            .get_session(&self.session_id, server, &self.candidate_headers)
            .await?;

        if client.crashed() {
            tracing::warn!(server = %server.name, "replacing crash-invalidated client");
            self.services.pool.remove(&server.uuid).await;
            return self
                .services
                .pool
                .get_session(&self.session_id, server, &self.candidate_headers)
                .await;
        }

        Some(client)
    }

    /// The guard runs after capability fetch, not on static params alone: a
    /// backend is dropped when its reported server name is this proxy.
    fn is_self_reference(&self, server: &ServerConfig, client: &ConnectedClient) -> bool {
        let unified = unified_server_name(&self.namespace_uuid);
        if server.name == unified {
            return true;
        }
        client
            .peer_info()
            .is_some_and(|info| info.server_info.name == unified)
    }

    fn active_server(&self, server_uuid: &str) -> Option<ServerConfig> {
        self.services
            .config
            .active_servers(&self.namespace_uuid)
            .into_iter()
            .find(|server| server.uuid == server_uuid)
            .cloned()
    }
}

/// One upstream session's view of its namespace: a full MCP server whose
/// catalog is the merged catalogs of every active backend.
pub struct ProxySession {
    ctx: BackendContext,
    tool_routes: RwLock<HashMap<String, String>>,
    prompt_routes: RwLock<HashMap<String, String>>,
    resource_routes: RwLock<HashMap<String, String>>,
}

impl ProxySession {
    pub fn new(
        services: Arc<ProxyServices>,
        namespace_uuid: impl Into<String>,
        session_id: impl Into<String>,
        candidate_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            ctx: BackendContext {
                services,
                namespace_uuid: namespace_uuid.into(),
                session_id: session_id.into(),
                candidate_headers,
            },
            tool_routes: RwLock::new(HashMap::new()),
            prompt_routes: RwLock::new(HashMap::new()),
            resource_routes: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    /// Run one operation against every active backend with settled
    /// semantics: failures are logged and omitted, never propagated. Results
    /// keep the namespace's backend declaration order.
    async fn fan_out<T, F, Fut>(&self, per_backend: F) -> Vec<(ServerConfig, T)>
    where
        F: Fn(Arc<ConnectedClient>) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<T, ServiceError>> + Send,
        T: Send + 'static,
    {
        let servers: Vec<ServerConfig> = self
            .ctx
            .services
            .config
            .active_servers(&self.ctx.namespace_uuid)
            .into_iter()
            .cloned()
            .collect();

        let mut visited: HashSet<String> = HashSet::new();
        let mut handles = Vec::new();

        for server in servers {
            if !visited.insert(server.uuid.clone()) {
                continue;
            }
            let ctx = self.ctx.clone();
            let op = per_backend.clone();
            handles.push(tokio::spawn(async move {
                let client = ctx.client_for(&server).await?;
                if ctx.is_self_reference(&server, &client) {
                    tracing::warn!(server = %server.name, "skipping self-referential backend");
                    return None;
                }
                client.touch();
                match op(client).await {
                    Ok(value) => Some((server, value)),
                    Err(error) => {
                        tracing::warn!(
                            server = %server.name,
                            error = %error,
                            "backend failed during fan-out"
                        );
                        None
                    }
                }
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(pair)) => results.push(pair),
                Ok(None) => {}
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "backend subtask aborted");
                }
            }
        }
        results
    }

    async fn list_tools_internal(&self) -> Result<ListToolsResult, McpError> {
        let gathered = self
            .fan_out(|client| async move { fetch_all_tools(client.peer().clone()).await })
            .await;

        let mut merged = Vec::new();
        let mut routes = HashMap::new();
        for (server, tools) in &gathered {
            for tool in tools {
                let mangled = mangle(&server.name, tool.name.as_ref());
                routes.insert(mangled.clone(), server.uuid.clone());
                let mut exported = tool.clone();
                exported.name = mangled.into();
                merged.push(exported);
            }
        }
        *self.tool_routes.write().await = routes;

        self.sync_catalog(&gathered).await;

        let tools = self
            .ctx
            .services
            .middleware
            .apply_list(&self.ctx.namespace_uuid, merged)
            .await;
        Ok(ListToolsResult::with_all_items(tools))
    }

    /// Push changed tool sets to the external catalog, gated by the
    /// per-backend fingerprint. Best-effort: failures are operator-log noise,
    /// never request errors.
    async fn sync_catalog(&self, gathered: &[(ServerConfig, Vec<Tool>)]) {
        let Some(catalog) = &self.ctx.services.catalog else {
            return;
        };
        let overrides = match self
            .ctx
            .services
            .overrides
            .overrides(&self.ctx.namespace_uuid)
            .await
        {
            Ok(overrides) => overrides,
            Err(error) => {
                tracing::warn!(error = %error, "override lookup failed; skipping catalog sync");
                return;
            }
        };

        for (server, tools) in gathered {
            let names: Vec<String> = tools.iter().map(|tool| tool.name.to_string()).collect();
            let fingerprint = FingerprintTracker::fingerprint(&names);
            if !self.ctx.services.fingerprints.update(&server.uuid, fingerprint) {
                continue;
            }

            let kept = filter_override_shadowed(names, &server.uuid, &overrides);
            let rows: Vec<CatalogTool> = tools
                .iter()
                .filter(|tool| kept.iter().any(|name| name == tool.name.as_ref()))
                .map(|tool| CatalogTool {
                    name: tool.name.to_string(),
                    description: tool.description.as_deref().map(str::to_string),
                    schema: serde_json::Value::Object((*tool.input_schema).clone()),
                })
                .collect();

            if let Err(error) = catalog.upsert_tools(&server.uuid, &rows).await {
                tracing::warn!(server = %server.name, error = %error, "catalog upsert failed");
                continue;
            }
            if let Err(error) = catalog.delete_absent(&server.uuid, &kept).await {
                tracing::warn!(server = %server.name, error = %error, "catalog prune failed");
            }
        }
    }

    async fn call_tool_internal(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, McpError> {
        let decision = self
            .ctx
            .services
            .middleware
            .apply_call(&self.ctx.namespace_uuid, request)
            .await
            .map_err(|error| McpError::internal_error(error.to_string(), None))?;
        let request = match decision {
            CallDecision::Deny(result) => return Ok(result),
            CallDecision::Forward(request) => request,
        };

        let name = request.name.to_string();
        let Some((prefix, original)) = split_mangled(&name) else {
            return Err(McpError::invalid_params(format!("Unknown tool: {name}"), None));
        };

        let routed = match self.tool_routes.read().await.get(&name).cloned() {
            Some(server_uuid) => match self.ctx.active_server(&server_uuid) {
                Some(server) => {
                    let client = self.ctx.client_for(&server).await.ok_or_else(|| {
                        McpError::internal_error(
                            format!("backend for tool '{name}' is unavailable"),
                            None,
                        )
                    })?;
                    Some((server, client))
                }
                None => None,
            },
            None => None,
        };

        let (_, client) = match routed {
            Some(pair) => pair,
            None => {
                // The table went stale (reorder or crash invalidation):
                // rediscover the owner by prefix and original name.
                let Some(pair) = self.resolve_tool_by_prefix(prefix, original).await else {
                    return Err(McpError::invalid_params(
                        format!("Unknown tool: {name}"),
                        None,
                    ));
                };
                self.tool_routes
                    .write()
                    .await
                    .insert(name.clone(), pair.0.uuid.clone());
                pair
            }
        };

        let mut downstream = request;
        downstream.name = original.to_string().into();

        client.touch();
        let progress = client.progress_watch();
        let call = client.peer().call_tool(downstream);
        match self.ctx.services.timeouts.run(progress, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(forward_error(error)),
            Err(_) => Err(McpError::internal_error(
                format!("tool call '{name}' timed out"),
                None,
            )),
        }
    }

    async fn resolve_tool_by_prefix(
        &self,
        prefix: &str,
        original: &str,
    ) -> Option<(ServerConfig, Arc<ConnectedClient>)> {
        let servers: Vec<ServerConfig> = self
            .ctx
            .services
            .config
            .active_servers(&self.ctx.namespace_uuid)
            .into_iter()
            .cloned()
            .collect();

        for server in servers {
            if sanitize(&server.name) != prefix {
                continue;
            }
            let Some(client) = self.ctx.client_for(&server).await else {
                continue;
            };
            if self.ctx.is_self_reference(&server, &client) {
                continue;
            }
            match fetch_all_tools(client.peer().clone()).await {
                Ok(tools) => {
                    if tools.iter().any(|tool| tool.name.as_ref() == original) {
                        return Some((server, client));
                    }
                }
                Err(error) => {
                    tracing::warn!(server = %server.name, error = %error, "re-resolution list failed");
                }
            }
        }
        None
    }

    async fn list_prompts_internal(&self) -> Result<ListPromptsResult, McpError> {
        let gathered = self
            .fan_out(|client| async move { fetch_all_prompts(client.peer().clone()).await })
            .await;

        let mut merged = Vec::new();
        let mut routes = HashMap::new();
        for (server, prompts) in gathered {
            for mut prompt in prompts {
                let mangled = mangle(&server.name, &prompt.name);
                routes.insert(mangled.clone(), server.uuid.clone());
                prompt.name = mangled.into();
                merged.push(prompt);
            }
        }
        *self.prompt_routes.write().await = routes;

        let mut result = ListPromptsResult::default();
        result.prompts = merged;
        Ok(result)
    }

    async fn get_prompt_internal(
        &self,
        request: GetPromptRequestParam,
    ) -> Result<GetPromptResult, McpError> {
        let name = request.name.to_string();
        let Some((prefix, original)) = split_mangled(&name) else {
            return Err(McpError::invalid_params(
                format!("Unknown prompt: {name}"),
                None,
            ));
        };

        let server_uuid = self.prompt_routes.read().await.get(&name).cloned();
        let resolved = match server_uuid.and_then(|uuid| self.ctx.active_server(&uuid)) {
            Some(server) => {
                let client = self.ctx.client_for(&server).await;
                client.map(|client| (server, client))
            }
            None => self.resolve_prompt_by_prefix(prefix, original).await,
        };

        let Some((server, client)) = resolved else {
            return Err(McpError::invalid_params(
                format!("Unknown prompt: {name}"),
                None,
            ));
        };
        self.prompt_routes
            .write()
            .await
            .insert(name.clone(), server.uuid.clone());

        let mut downstream = request;
        downstream.name = original.to_string().into();

        client.touch();
        let progress = client.progress_watch();
        let call = client.peer().get_prompt(downstream);
        match self.ctx.services.timeouts.run(progress, call).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(forward_error(error)),
            Err(_) => Err(McpError::internal_error(
                format!("prompt '{name}' timed out"),
                None,
            )),
        }
    }

    async fn resolve_prompt_by_prefix(
        &self,
        prefix: &str,
        original: &str,
    ) -> Option<(ServerConfig, Arc<ConnectedClient>)> {
        let servers: Vec<ServerConfig> = self
            .ctx
            .services
            .config
            .active_servers(&self.ctx.namespace_uuid)
            .into_iter()
            .cloned()
            .collect();

        for server in servers {
            if sanitize(&server.name) != prefix {
                continue;
            }
            let Some(client) = self.ctx.client_for(&server).await else {
                continue;
            };
            match fetch_all_prompts(client.peer().clone()).await {
                Ok(prompts) => {
                    if prompts.iter().any(|prompt| prompt.name == original) {
                        return Some((server, client));
                    }
                }
                Err(error) => {
                    tracing::warn!(server = %server.name, error = %error, "prompt re-resolution failed");
                }
            }
        }
        None
    }

    async fn list_resources_internal(&self) -> Result<ListResourcesResult, McpError> {
        let gathered = self
            .fan_out(|client| async move { fetch_all_resources(client.peer().clone()).await })
            .await;

        let mut merged = Vec::new();
        let mut routes = HashMap::new();
        for (server, resources) in gathered {
            for resource in resources {
                routes.insert(resource.uri.clone(), server.uuid.clone());
                merged.push(resource);
            }
        }
        *self.resource_routes.write().await = routes;

        let mut result = ListResourcesResult::default();
        result.resources = merged;
        Ok(result)
    }

    async fn read_resource_internal(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult, McpError> {
        let uri = request.uri.to_string();

        let mut server_uuid = self.resource_routes.read().await.get(&uri).cloned();
        if server_uuid.is_none() {
            // Resources route by URI; refresh the table once on a miss.
            let _ = self.list_resources_internal().await;
            server_uuid = self.resource_routes.read().await.get(&uri).cloned();
        }

        let resolved = server_uuid
            .and_then(|uuid| self.ctx.active_server(&uuid));
        let Some(server) = resolved else {
            return Err(McpError::invalid_params(
                format!("Unknown resource: {uri}"),
                None,
            ));
        };
        let Some(client) = self.ctx.client_for(&server).await else {
            return Err(McpError::internal_error(
                format!("backend for resource '{uri}' is unavailable"),
                None,
            ));
        };

        client.touch();
        client
            .peer()
            .read_resource(request)
            .await
            .map_err(forward_error)
    }

    async fn list_resource_templates_internal(
        &self,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let gathered = self
            .fan_out(|client| async move {
                fetch_all_resource_templates(client.peer().clone()).await
            })
            .await;

        let merged: Vec<ResourceTemplate> = gathered
            .into_iter()
            .flat_map(|(_, templates)| templates)
            .collect();

        let mut result = ListResourceTemplatesResult::default();
        result.resource_templates = merged;
        Ok(result)
    }
}

impl ServerHandler for ProxySession {
    async fn list_tools(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let mut result = self.list_tools_internal().await?;
        // Per-backend pagination is exhausted downstream and not exposed;
        // the request cursor is echoed back opaque.
        result.next_cursor = request.and_then(|param| param.cursor);
        Ok(result)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_internal(request).await
    }

    async fn list_prompts(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        let mut result = self.list_prompts_internal().await?;
        result.next_cursor = request.and_then(|param| param.cursor);
        Ok(result)
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.get_prompt_internal(request).await
    }

    async fn list_resources(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        let mut result = self.list_resources_internal().await?;
        result.next_cursor = request.and_then(|param| param.cursor);
        Ok(result)
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read_resource_internal(request).await
    }

    async fn list_resource_templates(
        &self,
        request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        let mut result = self.list_resource_templates_internal().await?;
        result.next_cursor = request.and_then(|param| param.cursor);
        Ok(result)
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = unified_server_name(&self.ctx.namespace_uuid);
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            prompts: Some(PromptsCapability::default()),
            resources: Some(ResourcesCapability {
                subscribe: Some(true),
                list_changed: None,
            }),
            ..Default::default()
        };
        info
    }
}

/// Downstream clients die with their session; the pool entry must not
/// outlive the proxy instance even if the transport layer forgot to clean up.
impl Drop for ProxySession {
    fn drop(&mut self) {
        let pool = Arc::clone(&self.ctx.services.pool);
        let session_id = self.ctx.session_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.cleanup_session(&session_id).await;
            });
        }
    }
}

fn forward_error(error: ServiceError) -> McpError {
    match error {
        ServiceError::McpError(error) => error,
        other => McpError::internal_error(other.to_string(), None),
    }
}

async fn fetch_all_tools(peer: Peer<RoleClient>) -> Result<Vec<Tool>, ServiceError> {
    let mut tools = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = peer
            .list_tools(cursor.clone().map(|cursor| PaginatedRequestParam {
                cursor: Some(cursor),
            }))
            .await?;
        tools.extend(page.tools);
        match page.next_cursor {
            Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                cursor = Some(next);
            }
            _ => return Ok(tools),
        }
    }
}

async fn fetch_all_prompts(peer: Peer<RoleClient>) -> Result<Vec<Prompt>, ServiceError> {
    let mut prompts = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = peer
            .list_prompts(cursor.clone().map(|cursor| PaginatedRequestParam {
                cursor: Some(cursor),
            }))
            .await?;
        prompts.extend(page.prompts);
        match page.next_cursor {
            Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                cursor = Some(next);
            }
            _ => return Ok(prompts),
        }
    }
}

async fn fetch_all_resources(peer: Peer<RoleClient>) -> Result<Vec<Resource>, ServiceError> {
    let mut resources = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = peer
            .list_resources(cursor.clone().map(|cursor| PaginatedRequestParam {
                cursor: Some(cursor),
            }))
            .await?;
        resources.extend(page.resources);
        match page.next_cursor {
            Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                cursor = Some(next);
            }
            _ => return Ok(resources),
        }
    }
}

async fn fetch_all_resource_templates(
    peer: Peer<RoleClient>,
) -> Result<Vec<ResourceTemplate>, ServiceError> {
    let mut templates = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = peer
            .list_resource_templates(cursor.clone().map(|cursor| PaginatedRequestParam {
                cursor: Some(cursor),
            }))
            .await?;
        templates.extend(page.resource_templates);
        match page.next_cursor {
            Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => {
                cursor = Some(next);
            }
            _ => return Ok(templates),
        }
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
