use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use mmcp_config::{GatewayConfig, ToolOverride};
use rmcp::model::{CallToolRequestParam, CallToolResult, Content, Tool};
use tokio::sync::RwLock;

use crate::naming::sanitize;

/// Source of override rows and server prefixes for one namespace. The
/// control plane's store plugs in here; the static config is the default.
#[async_trait]
pub trait OverrideProvider: Send + Sync {
    async fn overrides(&self, namespace_uuid: &str) -> Result<Vec<ToolOverride>>;

    /// `(sanitized server name, server_uuid)` pairs for the namespace.
    async fn server_prefixes(&self, namespace_uuid: &str) -> Result<Vec<(String, String)>>;
}

pub struct ConfigOverrideProvider {
    config: Arc<GatewayConfig>,
}

impl ConfigOverrideProvider {
    pub fn new(config: Arc<GatewayConfig>) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

#[async_trait]
impl OverrideProvider for ConfigOverrideProvider {
    async fn overrides(&self, namespace_uuid: &str) -> Result<Vec<ToolOverride>> {
        Ok(self
            .config
            .overrides_for(namespace_uuid)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn server_prefixes(&self, namespace_uuid: &str) -> Result<Vec<(String, String)>> {
        Ok(self
            .config
            .active_servers(namespace_uuid)
            .into_iter()
            .map(|server| (sanitize(&server.name), server.uuid.clone()))
            .collect())
    }
}

#[derive(Debug, Clone, Default)]
struct ResolvedOverride {
    renamed_mangled: Option<String>,
    description_override: Option<String>,
    enabled: bool,
}

/// Per-namespace override table resolved to mangled names.
#[derive(Debug, Default)]
pub struct OverrideTable {
    /// original mangled name -> override entry
    by_original: HashMap<String, ResolvedOverride>,
    /// renamed mangled name -> original mangled name
    reverse: HashMap<String, String>,
}

impl OverrideTable {
    fn build(overrides: &[ToolOverride], prefixes: &[(String, String)]) -> Self {
        let mut table = Self::default();

        for entry in overrides {
            let Some(prefix) = prefixes
                .iter()
                .find(|(_, uuid)| *uuid == entry.server_uuid)
                .map(|(prefix, _)| prefix)
            else {
                continue;
            };

            let original_mangled = format!("{prefix}__{}", entry.original_name);
            let renamed_mangled = entry
                .override_name
                .as_ref()
                .filter(|renamed| **renamed != entry.original_name)
                .map(|renamed| format!("{prefix}__{renamed}"));

            if entry.enabled {
                if let Some(renamed) = &renamed_mangled {
                    table
                        .reverse
                        .insert(renamed.clone(), original_mangled.clone());
                }
            }

            table.by_original.insert(
                original_mangled,
                ResolvedOverride {
                    renamed_mangled,
                    description_override: entry.description_override.clone(),
                    enabled: entry.enabled,
                },
            );
        }

        table
    }

    /// Map a possibly-renamed mangled name back to the original one.
    pub fn resolve_original(&self, name: &str) -> String {
        self.reverse
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn is_disabled(&self, original_mangled: &str) -> bool {
        self.by_original
            .get(original_mangled)
            .is_some_and(|entry| !entry.enabled)
    }
}

/// Namespace-scoped cache of a middleware's resolved table.
///
/// Invalidation must run together with the write that changed the underlying
/// rows; the disable knob forces a rebuild on every request.
pub struct MiddlewareCache<T> {
    disabled: bool,
    inner: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> MiddlewareCache<T> {
    pub fn new(disabled: bool) -> Self {
        Self {
            disabled,
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_build<F, Fut>(&self, namespace_uuid: &str, build: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.disabled {
            if let Some(cached) = self.inner.read().await.get(namespace_uuid) {
                return Ok(Arc::clone(cached));
            }
        }

        let built = Arc::new(build().await?);
        if !self.disabled {
            self.inner
                .write()
                .await
                .insert(namespace_uuid.to_string(), Arc::clone(&built));
        }
        Ok(built)
    }

    pub async fn invalidate(&self, namespace_uuid: &str) {
        self.inner.write().await.remove(namespace_uuid);
    }

    pub async fn invalidate_all(&self) {
        self.inner.write().await.clear();
    }
}

/// Outcome of running the call-side middleware chain.
pub enum CallDecision {
    Forward(CallToolRequestParam),
    /// Short-circuit with a structured result; nothing reaches a backend.
    Deny(CallToolResult),
}

/// One middleware around the two leaf tool operations.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    /// Transform the merged tool list before it goes upstream.
    async fn on_list(&self, namespace_uuid: &str, tools: Vec<Tool>) -> Result<Vec<Tool>>;

    /// Inspect or rewrite a call before routing; may short-circuit.
    async fn on_call(
        &self,
        namespace_uuid: &str,
        request: CallToolRequestParam,
    ) -> Result<CallDecision>;

    /// Drop cached state for one namespace.
    async fn invalidate(&self, _namespace_uuid: &str) {}
}

type DenyMessageFn = dyn Fn(&str) -> String + Send + Sync;

/// Removes disabled tools from listings and denies calls to them.
pub struct FilterToolsMiddleware {
    provider: Arc<dyn OverrideProvider>,
    cache: MiddlewareCache<OverrideTable>,
    deny_message: Box<DenyMessageFn>,
}

impl FilterToolsMiddleware {
    pub fn new(provider: Arc<dyn OverrideProvider>, cache_disabled: bool) -> Arc<Self> {
        Self::with_deny_message(provider, cache_disabled, |name| {
            format!("Access denied to tool \"{name}\": it is disabled in this namespace")
        })
    }

    pub fn with_deny_message(
        provider: Arc<dyn OverrideProvider>,
        cache_disabled: bool,
        deny_message: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            cache: MiddlewareCache::new(cache_disabled),
            deny_message: Box::new(deny_message),
        })
    }

    async fn table(&self, namespace_uuid: &str) -> Result<Arc<OverrideTable>> {
        self.cache
            .get_or_build(namespace_uuid, || async {
                let overrides = self.provider.overrides(namespace_uuid).await?;
                let prefixes = self.provider.server_prefixes(namespace_uuid).await?;
                Ok(OverrideTable::build(&overrides, &prefixes))
            })
            .await
    }
}

#[async_trait]
impl ToolMiddleware for FilterToolsMiddleware {
    async fn on_list(&self, namespace_uuid: &str, tools: Vec<Tool>) -> Result<Vec<Tool>> {
        let table = self.table(namespace_uuid).await?;
        Ok(tools
            .into_iter()
            .filter(|tool| !table.is_disabled(tool.name.as_ref()))
            .collect())
    }

    async fn on_call(
        &self,
        namespace_uuid: &str,
        request: CallToolRequestParam,
    ) -> Result<CallDecision> {
        let table = self.table(namespace_uuid).await?;
        let original = table.resolve_original(request.name.as_ref());
        if table.is_disabled(&original) {
            let message = (self.deny_message)(request.name.as_ref());
            return Ok(CallDecision::Deny(CallToolResult::error(vec![
                Content::text(message),
            ])));
        }
        Ok(CallDecision::Forward(request))
    }

    async fn invalidate(&self, namespace_uuid: &str) {
        self.cache.invalidate(namespace_uuid).await;
    }
}

/// Applies per-namespace rename/description overrides on listings and maps
/// renamed calls back to the original tool.
pub struct ToolOverridesMiddleware {
    provider: Arc<dyn OverrideProvider>,
    cache: MiddlewareCache<OverrideTable>,
}

impl ToolOverridesMiddleware {
    pub fn new(provider: Arc<dyn OverrideProvider>, cache_disabled: bool) -> Arc<Self> {
        Arc::new(Self {
            provider,
            cache: MiddlewareCache::new(cache_disabled),
        })
    }

    async fn table(&self, namespace_uuid: &str) -> Result<Arc<OverrideTable>> {
        self.cache
            .get_or_build(namespace_uuid, || async {
                let overrides = self.provider.overrides(namespace_uuid).await?;
                let prefixes = self.provider.server_prefixes(namespace_uuid).await?;
                Ok(OverrideTable::build(&overrides, &prefixes))
            })
            .await
    }
}

#[async_trait]
impl ToolMiddleware for ToolOverridesMiddleware {
    async fn on_list(&self, namespace_uuid: &str, tools: Vec<Tool>) -> Result<Vec<Tool>> {
        let table = self.table(namespace_uuid).await?;
        Ok(tools
            .into_iter()
            .map(|mut tool| {
                if let Some(entry) = table.by_original.get(tool.name.as_ref()) {
                    if entry.enabled {
                        if let Some(renamed) = &entry.renamed_mangled {
                            tool.name = renamed.clone().into();
                        }
                        if let Some(description) = &entry.description_override {
                            tool.description = Some(description.clone().into());
                        }
                    }
                }
                tool
            })
            .collect())
    }

    async fn on_call(
        &self,
        namespace_uuid: &str,
        request: CallToolRequestParam,
    ) -> Result<CallDecision> {
        let table = self.table(namespace_uuid).await?;
        let original = table.resolve_original(request.name.as_ref());
        if original != request.name.as_ref() {
            let mut request = request;
            request.name = original.into();
            return Ok(CallDecision::Forward(request));
        }
        Ok(CallDecision::Forward(request))
    }

    async fn invalidate(&self, namespace_uuid: &str) {
        self.cache.invalidate(namespace_uuid).await;
    }
}

/// Ordered middleware pipeline around the two leaf handlers.
///
/// The declaration order is the list-side order; the call side runs the same
/// handlers in reverse, matching function-style wrapping where the outermost
/// list transform corresponds to the innermost call transform.
pub struct MiddlewareChain {
    handlers: Vec<Arc<dyn ToolMiddleware>>,
}

impl MiddlewareChain {
    pub fn new(handlers: Vec<Arc<dyn ToolMiddleware>>) -> Arc<Self> {
        Arc::new(Self { handlers })
    }

    /// The standard pipeline: filter disabled tools, then apply overrides.
    pub fn standard(provider: Arc<dyn OverrideProvider>, cache_disabled: bool) -> Arc<Self> {
        Self::new(vec![
            FilterToolsMiddleware::new(Arc::clone(&provider), cache_disabled),
            ToolOverridesMiddleware::new(provider, cache_disabled),
        ])
    }

    pub async fn apply_list(&self, namespace_uuid: &str, mut tools: Vec<Tool>) -> Vec<Tool> {
        for handler in &self.handlers {
            match handler.on_list(namespace_uuid, tools).await {
                Ok(transformed) => tools = transformed,
                Err(error) => {
                    tracing::warn!(namespace = %namespace_uuid, error = %error, "list middleware failed");
                    return Vec::new();
                }
            }
        }
        tools
    }

    pub async fn apply_call(
        &self,
        namespace_uuid: &str,
        mut request: CallToolRequestParam,
    ) -> Result<CallDecision> {
        for handler in self.handlers.iter().rev() {
            match handler.on_call(namespace_uuid, request).await? {
                CallDecision::Forward(next) => request = next,
                deny @ CallDecision::Deny(_) => return Ok(deny),
            }
        }
        Ok(CallDecision::Forward(request))
    }

    pub async fn invalidate(&self, namespace_uuid: &str) {
        for handler in &self.handlers {
            handler.invalidate(namespace_uuid).await;
        }
    }
}
