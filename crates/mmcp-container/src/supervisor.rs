use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use mmcp_config::{BackendTransport, ServerConfig};
use mmcp_pool::ErrorStateProbe;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeError};
use crate::store::{ContainerSession, ContainerStateStore, ContainerStatus};

/// Restart count at which a container is declared flapping.
const RESTART_ERROR_LIMIT: u32 = 3;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
const READY_POLL_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Image of the in-container stdio runner.
    pub image: String,
    /// Internal bridge network for name-based resolution. `None` switches to
    /// the host-port publishing scheme.
    pub network: Option<String>,
    pub internal_port: u16,
    /// First host port handed out under the host-port scheme.
    pub host_port_base: u16,
    /// Creation failures tolerated before the sticky error state.
    pub max_retries: u32,
    pub health_interval: Duration,
    pub sync_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            image: "metamcp/stdio-runner:latest".to_string(),
            network: Some("metamcp-net".to_string()),
            internal_port: 12006,
            host_port_base: 24600,
            max_retries: 3,
            health_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(30),
        }
    }
}

struct RunningContainer {
    container_id: String,
    container_name: String,
    internal_url: String,
    health_token: CancellationToken,
}

/// Supervises one container per stdio backend.
///
/// State machine per backend: `absent -> creating -> running -> stopped ->
/// running ...` plus the sticky sink `error`. Only [`retry_container`] leaves
/// `error`; neither connection attempts nor the periodic sync recreate an
/// errored container.
///
/// [`retry_container`]: ContainerSupervisor::retry_container
pub struct ContainerSupervisor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn ContainerStateStore>,
    config: SupervisorConfig,
    running: Mutex<HashMap<String, RunningContainer>>,
    next_host_port: AtomicU16,
    shutdown: CancellationToken,
}

impl ContainerSupervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ContainerStateStore>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let next_host_port = AtomicU16::new(config.host_port_base);
        Arc::new(Self {
            runtime,
            store,
            config,
            running: Mutex::new(HashMap::new()),
            next_host_port,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> Arc<dyn ContainerStateStore> {
        Arc::clone(&self.store)
    }

    /// Start the global reconcile loop.
    pub fn start(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.config.sync_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = supervisor.sync_once().await {
                            tracing::warn!(error = %error, "container sync pass failed");
                        }
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut running = self.running.lock().await;
        for (_, container) in running.drain() {
            container.health_token.cancel();
        }
    }

    /// Allocate (or re-allocate) the container for a stdio backend.
    ///
    /// Returns the URL the gateway dials. Honors the sticky error state and
    /// the bounded creation retry budget.
    pub async fn create_container(self: &Arc<Self>, server: &ServerConfig) -> Result<String> {
        let mut session = match self.store.get_by_server(&server.uuid).await? {
            Some(session) => session,
            None => ContainerSession::new(&server.uuid, self.config.max_retries),
        };

        if session.status == ContainerStatus::Error {
            bail!(
                "container for '{}' is in error state; run an explicit retry to recover",
                server.name
            );
        }

        if let Some(existing) = self.running.lock().await.get(&server.uuid) {
            return Ok(existing.internal_url.clone());
        }

        let name = container_name(&server.uuid);
        let spec = self.spec_for(server, &name)?;
        let url = url_for(&spec);

        match self.start_container(&spec).await {
            Ok(container_id) => {
                session.container_id = Some(container_id.clone());
                session.container_name = Some(name.clone());
                session.internal_url = Some(url.clone());
                session.status = ContainerStatus::Running;
                session.error_message = None;
                self.store.upsert(session).await?;

                self.track_running(server.uuid.clone(), container_id, name, url.clone())
                    .await;
                Ok(url)
            }
            Err(error) => {
                session.retry_count += 1;
                session.last_retry_at = Some(Utc::now());
                if session.retry_count >= session.max_retries {
                    session.status = ContainerStatus::Error;
                    session.error_message = Some(error.to_string());
                    tracing::error!(
                        server = %server.name,
                        retry_count = session.retry_count,
                        error = %error,
                        "container creation exhausted retries; entering error state"
                    );
                    self.store.upsert(session).await?;
                    bail!("container for '{}' entered error state: {error}", server.name);
                }

                session.status = ContainerStatus::Stopped;
                self.store.upsert(session).await?;
                Err(error).with_context(|| {
                    format!("container creation failed for '{}'", server.name)
                })
            }
        }
    }

    /// Operator-initiated recovery from the sticky error state.
    pub async fn retry_container(self: &Arc<Self>, server: &ServerConfig) -> Result<String> {
        if let Some(mut session) = self.store.get_by_server(&server.uuid).await? {
            session.retry_count = 0;
            session.status = ContainerStatus::Stopped;
            session.error_message = None;
            self.store.upsert(session).await?;
        }
        self.create_container(server).await
    }

    /// Stop and remove the backend's container; persists `stopped`.
    pub async fn remove_container(&self, server_uuid: &str) -> Result<()> {
        let handle = self.running.lock().await.remove(server_uuid);
        if let Some(container) = &handle {
            container.health_token.cancel();
        }

        let name = match &handle {
            Some(container) => Some(container.container_name.clone()),
            None => self
                .store
                .get_by_server(server_uuid)
                .await?
                .and_then(|session| session.container_name),
        };

        if let Some(name) = name {
            if let Err(error) = self.runtime.stop(&name).await {
                if !error.is_not_found() {
                    tracing::warn!(container = %name, error = %error, "failed to stop container");
                }
            }
            if let Err(error) = self.runtime.remove(&name).await {
                if !error.is_not_found() {
                    tracing::warn!(container = %name, error = %error, "failed to remove container");
                }
            }
        }

        self.mark_stopped(server_uuid).await
    }

    /// Last `n` combined log lines of the backend's container, timestamped.
    pub async fn tail_logs(&self, server_uuid: &str, n: usize) -> Result<Vec<String>> {
        let name = {
            let running = self.running.lock().await;
            match running.get(server_uuid) {
                Some(container) => container.container_name.clone(),
                None => self
                    .store
                    .get_by_server(server_uuid)
                    .await?
                    .and_then(|session| session.container_name)
                    .with_context(|| format!("no container recorded for server {server_uuid}"))?,
            }
        };

        self.runtime
            .logs(&name, n, true)
            .await
            .map_err(anyhow::Error::from)
    }

    /// One health-loop tick for one backend. Public so tests drive it
    /// without waiting out the interval.
    pub async fn health_probe(&self, server_uuid: &str) -> Result<()> {
        let name = {
            let running = self.running.lock().await;
            match running.get(server_uuid) {
                Some(container) => container.container_name.clone(),
                None => return Ok(()),
            }
        };

        match self.runtime.inspect(&name).await {
            Ok(state) if state.restart_count >= RESTART_ERROR_LIMIT => {
                self.flag_flapping(server_uuid, &name, state.restart_count)
                    .await
            }
            Ok(state) if !state.running => self.mark_stopped(server_uuid).await,
            Ok(_) => Ok(()),
            Err(error) if error.is_not_found() => self.mark_stopped(server_uuid).await,
            Err(error) => {
                tracing::warn!(container = %name, error = %error, "health inspect failed");
                Ok(())
            }
        }
    }

    /// One reconcile pass: align persisted status with actual container
    /// state, flag flapping containers, and log retry statistics.
    pub async fn sync_once(&self) -> Result<()> {
        let sessions = self.store.list().await?;

        let retried = sessions.iter().filter(|s| s.retry_count > 0).count();
        let max_retry = sessions.iter().map(|s| s.retry_count).max().unwrap_or(0);
        tracing::info!(
            tracked = sessions.len(),
            retried,
            max_retry,
            "container sync pass"
        );

        for session in sessions {
            if session.status == ContainerStatus::Error {
                continue;
            }
            let Some(name) = session.container_name.clone() else {
                continue;
            };

            match self.runtime.inspect(&name).await {
                Ok(state) if state.restart_count >= RESTART_ERROR_LIMIT => {
                    tracing::warn!(
                        container = %name,
                        restart_count = state.restart_count,
                        "container restarting excessively"
                    );
                    self.flag_flapping(&session.server_uuid, &name, state.restart_count)
                        .await?;
                }
                Ok(state) => {
                    let actual = if state.running {
                        ContainerStatus::Running
                    } else {
                        ContainerStatus::Stopped
                    };
                    if actual != session.status {
                        let mut updated = session.clone();
                        updated.status = actual;
                        self.store.upsert(updated).await?;
                    }
                }
                Err(error) if error.is_not_found() => {
                    if session.status == ContainerStatus::Running {
                        self.mark_stopped(&session.server_uuid).await?;
                    }
                }
                Err(error) => {
                    tracing::warn!(container = %name, error = %error, "sync inspect failed");
                }
            }
        }

        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        // A leftover container under the same name blocks creation.
        if let Err(error) = self.runtime.remove(&spec.name).await {
            if !error.is_not_found() {
                tracing::debug!(container = %spec.name, error = %error, "pre-create cleanup failed");
            }
        }

        let container_id = self.runtime.create(spec).await?;
        self.wait_ready(&spec.name).await?;
        Ok(container_id)
    }

    async fn wait_ready(&self, name: &str) -> Result<(), RuntimeError> {
        for _ in 0..READY_POLL_ATTEMPTS {
            match self.runtime.inspect(name).await {
                Ok(state) if state.running => return Ok(()),
                Ok(_) => {}
                Err(error) if error.is_not_found() => {
                    return Err(RuntimeError::NotFound(name.to_string()));
                }
                Err(_) => {}
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
        Err(RuntimeError::Failed(format!(
            "container '{name}' did not become ready"
        )))
    }

    fn spec_for(&self, server: &ServerConfig, name: &str) -> Result<ContainerSpec> {
        let BackendTransport::Stdio { command, args, .. } = &server.transport else {
            bail!("server '{}' is not a stdio backend", server.name);
        };

        let mut env = server.resolved_env();
        env.insert("MCP_SERVER_COMMAND".to_string(), command.clone());
        env.insert("MCP_SERVER_ARGS".to_string(), args.join(" "));

        let host_port = if self.config.network.is_none() {
            Some(self.next_host_port.fetch_add(1, Ordering::SeqCst))
        } else {
            None
        };

        Ok(ContainerSpec {
            name: name.to_string(),
            image: self.config.image.clone(),
            env,
            network: self.config.network.clone(),
            internal_port: self.config.internal_port,
            host_port,
        })
    }

    async fn track_running(
        self: &Arc<Self>,
        server_uuid: String,
        container_id: String,
        container_name: String,
        internal_url: String,
    ) {
        let health_token = self.shutdown.child_token();
        self.running.lock().await.insert(
            server_uuid.clone(),
            RunningContainer {
                container_id,
                container_name,
                internal_url,
                health_token: health_token.clone(),
            },
        );

        let supervisor = Arc::clone(self);
        let interval = self.config.health_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = health_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(error) = supervisor.health_probe(&server_uuid).await {
                            tracing::warn!(server = %server_uuid, error = %error, "health probe failed");
                        }
                        if !supervisor.running.lock().await.contains_key(&server_uuid) {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Stop the health loop, drop the in-memory handle, persist `stopped`.
    async fn mark_stopped(&self, server_uuid: &str) -> Result<()> {
        if let Some(container) = self.running.lock().await.remove(server_uuid) {
            container.health_token.cancel();
        }
        if let Some(mut session) = self.store.get_by_server(server_uuid).await? {
            session.status = ContainerStatus::Stopped;
            self.store.upsert(session).await?;
        }
        Ok(())
    }

    /// Stop+remove a flapping container and persist the sticky error state.
    async fn flag_flapping(
        &self,
        server_uuid: &str,
        name: &str,
        restart_count: u32,
    ) -> Result<()> {
        if let Err(error) = self.runtime.stop(name).await {
            if !error.is_not_found() {
                tracing::warn!(container = %name, error = %error, "failed to stop flapping container");
            }
        }
        if let Err(error) = self.runtime.remove(name).await {
            if !error.is_not_found() {
                tracing::warn!(container = %name, error = %error, "failed to remove flapping container");
            }
        }

        if let Some(container) = self.running.lock().await.remove(server_uuid) {
            container.health_token.cancel();
        }

        if let Some(mut session) = self.store.get_by_server(server_uuid).await? {
            session.status = ContainerStatus::Error;
            session.error_message = Some(format!(
                "Container has restarted {restart_count} times due to crashes"
            ));
            self.store.upsert(session).await?;
        }
        Ok(())
    }

    /// Currently tracked container id for a backend, if any.
    pub async fn container_id(&self, server_uuid: &str) -> Option<String> {
        self.running
            .lock()
            .await
            .get(server_uuid)
            .map(|container| container.container_id.clone())
    }
}

/// The connector consults the supervisor before dialing stdio backends.
#[async_trait]
impl ErrorStateProbe for ContainerSupervisor {
    async fn is_errored(&self, server_uuid: &str) -> bool {
        match self.store.get_by_server(server_uuid).await {
            Ok(Some(session)) => session.status == ContainerStatus::Error,
            Ok(None) => false,
            Err(error) => {
                tracing::warn!(server = %server_uuid, error = %error, "error-state lookup failed");
                false
            }
        }
    }

    async fn stdio_endpoint(&self, server_uuid: &str) -> Option<String> {
        if let Some(container) = self.running.lock().await.get(server_uuid) {
            return Some(container.internal_url.clone());
        }
        match self.store.get_by_server(server_uuid).await {
            Ok(Some(session)) if session.status == ContainerStatus::Running => {
                session.internal_url
            }
            _ => None,
        }
    }
}

fn container_name(server_uuid: &str) -> String {
    format!("metamcp-{server_uuid}")
}

fn url_for(spec: &ContainerSpec) -> String {
    match spec.host_port {
        Some(host_port) => format!("http://127.0.0.1:{host_port}/sse"),
        None => format!("http://{}:{}/sse", spec.name, spec.internal_port),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
