use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mmcp_config::{BackendTransport, RuntimeSettings, ServerConfig, transform_localhost_url};
use rmcp::model::{ClientInfo, ProgressNotificationParam, ServerInfo};
use rmcp::service::{NotificationContext, Peer, RunningService};
use rmcp::{ClientHandler, RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use crate::logs::StderrLogStore;
use crate::pool::Connect;

const SHUTDOWN_GRACE_SECS: u64 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("backend is in error state")]
    ErrorState,
    #[error("failed to spawn backend process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to capture child stdio")]
    MissingPipe,
    #[error("transport connect failed: {0}")]
    Transport(String),
    #[error("MCP initialize failed: {0}")]
    Handshake(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Invoked when a stdio backend process exits on its own.
pub type CrashCallback = Arc<dyn Fn(&str, Option<i32>) + Send + Sync>;

/// Lets the connector consult the container supervisor before dialing.
#[async_trait]
pub trait ErrorStateProbe: Send + Sync {
    /// True when the backend is in sticky error state and must not be dialed.
    async fn is_errored(&self, server_uuid: &str) -> bool;

    /// HTTP endpoint replacing the direct subprocess for supervised stdio
    /// backends; `None` means spawn locally.
    async fn stdio_endpoint(&self, server_uuid: &str) -> Option<String>;
}

/// Everything the connector needs besides the per-server parameters.
#[derive(Clone)]
pub struct ConnectContext {
    pub settings: RuntimeSettings,
    pub log_store: Arc<StderrLogStore>,
    pub error_probe: Option<Arc<dyn ErrorStateProbe>>,
    pub on_crash: Option<CrashCallback>,
    /// Delay between connection attempts. Fixed at 5 s in production; tests
    /// shorten it.
    pub retry_backoff: Duration,
}

impl ConnectContext {
    pub fn new(settings: RuntimeSettings, log_store: Arc<StderrLogStore>) -> Self {
        Self {
            settings,
            log_store,
            error_probe: None,
            on_crash: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_error_probe(mut self, probe: Arc<dyn ErrorStateProbe>) -> Self {
        self.error_probe = Some(probe);
        self
    }

    pub fn with_crash_callback(mut self, on_crash: CrashCallback) -> Self {
        self.on_crash = Some(on_crash);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Client-side handler for downstream sessions; counts progress notifications
/// so call timeouts can reset on activity.
#[derive(Clone)]
pub struct BackendClientHandler {
    progress_tx: watch::Sender<u64>,
}

impl BackendClientHandler {
    fn new() -> (Self, watch::Receiver<u64>) {
        let (progress_tx, progress_rx) = watch::channel(0);
        (Self { progress_tx }, progress_rx)
    }
}

impl ClientHandler for BackendClientHandler {
    async fn on_progress(
        &self,
        _params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) {
        self.progress_tx.send_modify(|count| *count += 1);
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo::default()
    }
}

/// Keeps the child process alive and reports unexpected exits.
struct StdioSupervision {
    token: CancellationToken,
    waiter: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StdioSupervision {
    fn spawn(
        mut child: tokio::process::Child,
        server_uuid: String,
        crashed: Arc<AtomicBool>,
        on_crash: Option<CrashCallback>,
    ) -> Self {
        let token = CancellationToken::new();
        let watch_token = token.clone();

        let waiter = tokio::spawn(async move {
            tokio::select! {
                _ = watch_token.cancelled() => {
                    match tokio::time::timeout(
                        Duration::from_secs(SHUTDOWN_GRACE_SECS),
                        child.wait(),
                    )
                    .await
                    {
                        Ok(Ok(_)) => {}
                        Ok(Err(error)) => {
                            tracing::debug!(error = %error, "failed to wait for backend child");
                        }
                        Err(_) => {
                            let _ = child.kill().await;
                        }
                    }
                }
                status = child.wait() => {
                    crashed.store(true, Ordering::SeqCst);
                    let code = status.ok().and_then(|s| s.code());
                    tracing::warn!(
                        server = %server_uuid,
                        exit_code = ?code,
                        "backend process exited unexpectedly"
                    );
                    if let Some(callback) = on_crash {
                        callback(&server_uuid, code);
                    }
                }
            }
        });

        Self {
            token,
            waiter: Mutex::new(Some(waiter)),
        }
    }

    async fn shutdown(&self) {
        self.token.cancel();
        if let Some(waiter) = self.waiter.lock().await.take() {
            let _ = waiter.await;
        }
    }
}

/// A live MCP client session to one backend.
pub struct ConnectedClient {
    pub server_uuid: String,
    pub server_name: String,
    peer: Peer<RoleClient>,
    peer_info: Option<ServerInfo>,
    progress: watch::Receiver<u64>,
    service: Mutex<Option<RunningService<RoleClient, BackendClientHandler>>>,
    stdio: Option<StdioSupervision>,
    crashed: Arc<AtomicBool>,
    last_used: std::sync::Mutex<std::time::Instant>,
}

impl ConnectedClient {
    pub fn peer(&self) -> &Peer<RoleClient> {
        &self.peer
    }

    /// Capabilities reported by the backend's `initialize` response.
    pub fn peer_info(&self) -> Option<&ServerInfo> {
        self.peer_info.as_ref()
    }

    /// Progress-notification counter; bumps whenever the backend reports
    /// progress for any in-flight request.
    pub fn progress_watch(&self) -> watch::Receiver<u64> {
        self.progress.clone()
    }

    pub fn crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn touch(&self) {
        *self.last_used.lock().expect("last_used poisoned") = std::time::Instant::now();
    }

    pub fn last_used(&self) -> std::time::Instant {
        *self.last_used.lock().expect("last_used poisoned")
    }

    /// Tear down the client session and, for stdio, the child process.
    /// Idempotent.
    pub async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
        if let Some(stdio) = &self.stdio {
            stdio.shutdown().await;
        }
    }
}

/// Establishes downstream MCP sessions per the configured transport.
pub struct BackendConnector {
    ctx: ConnectContext,
}

impl BackendConnector {
    pub fn new(ctx: ConnectContext) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    async fn try_connect(
        &self,
        server: &ServerConfig,
        extra_headers: &HashMap<String, String>,
    ) -> Result<ConnectedClient, ConnectorError> {
        match &server.transport {
            BackendTransport::Stdio { command, args, .. } => {
                let endpoint = match &self.ctx.error_probe {
                    Some(probe) => probe.stdio_endpoint(&server.uuid).await,
                    None => None,
                };
                match endpoint {
                    Some(url) => self.connect_sse(server, &url, extra_headers).await,
                    None => self.connect_stdio(server, command, args).await,
                }
            }
            BackendTransport::Sse { url } => {
                let url = self.effective_url(url);
                self.connect_sse(server, &url, extra_headers).await
            }
            BackendTransport::StreamableHttp { url } => {
                let url = self.effective_url(url);
                self.connect_streamable_http(server, &url, extra_headers)
                    .await
            }
        }
    }

    fn effective_url(&self, url: &str) -> String {
        if self.ctx.settings.transform_localhost {
            transform_localhost_url(url)
        } else {
            url.to_string()
        }
    }

    async fn connect_stdio(
        &self,
        server: &ServerConfig,
        command: &str,
        args: &[String],
    ) -> Result<ConnectedClient, ConnectorError> {
        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in server.resolved_env() {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Until the supervision task takes ownership, a failed handshake must
        // not leak the child.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ConnectorError::Spawn)?;
        let stdout = child.stdout.take().ok_or(ConnectorError::MissingPipe)?;
        let stdin = child.stdin.take().ok_or(ConnectorError::MissingPipe)?;

        if let Some(stderr) = child.stderr.take() {
            let log_store = Arc::clone(&self.ctx.log_store);
            let server_uuid = server.uuid.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log_store.push(&server_uuid, line);
                }
            });
        }

        let (handler, progress) = BackendClientHandler::new();
        let service = handler
            .serve((stdout, stdin))
            .await
            .map_err(|error| ConnectorError::Handshake(error.to_string()))?;

        let crashed = Arc::new(AtomicBool::new(false));
        let stdio = StdioSupervision::spawn(
            child,
            server.uuid.clone(),
            Arc::clone(&crashed),
            self.ctx.on_crash.clone(),
        );

        Ok(self.finish(server, service, progress, Some(stdio), crashed))
    }

    async fn connect_sse(
        &self,
        server: &ServerConfig,
        url: &str,
        extra_headers: &HashMap<String, String>,
    ) -> Result<ConnectedClient, ConnectorError> {
        use rmcp::transport::sse_client::{SseClientConfig, SseClientTransport};

        let client = self.http_client(server, extra_headers)?;
        let transport = SseClientTransport::start_with_client(
            client,
            SseClientConfig {
                sse_endpoint: url.to_string().into(),
                ..Default::default()
            },
        )
        .await
        .map_err(|error| ConnectorError::Transport(error.to_string()))?;

        let (handler, progress) = BackendClientHandler::new();
        let service = handler
            .serve(transport)
            .await
            .map_err(|error| ConnectorError::Handshake(error.to_string()))?;

        Ok(self.finish(server, service, progress, None, Arc::new(AtomicBool::new(false))))
    }

    async fn connect_streamable_http(
        &self,
        server: &ServerConfig,
        url: &str,
        extra_headers: &HashMap<String, String>,
    ) -> Result<ConnectedClient, ConnectorError> {
        use rmcp::transport::StreamableHttpClientTransport;
        use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;

        let client = self.http_client(server, extra_headers)?;
        let transport = StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(url.to_string()),
        );

        let (handler, progress) = BackendClientHandler::new();
        let service = handler
            .serve(transport)
            .await
            .map_err(|error| ConnectorError::Handshake(error.to_string()))?;

        Ok(self.finish(server, service, progress, None, Arc::new(AtomicBool::new(false))))
    }

    /// reqwest client carrying static headers, forwarded headers, and the
    /// backend auth token (OAuth access token preferred over static bearer).
    fn http_client(
        &self,
        server: &ServerConfig,
        extra_headers: &HashMap<String, String>,
    ) -> Result<reqwest::Client, ConnectorError> {
        use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

        let mut headers = HeaderMap::new();
        for (name, value) in server.static_headers.iter().chain(extra_headers.iter()) {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => {
                    tracing::warn!(server = %server.name, header = %name, "skipping invalid header");
                }
            }
        }
        if let Some(token) = server.auth_token() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|error| ConnectorError::HttpClient(error.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|error| ConnectorError::HttpClient(error.to_string()))
    }

    fn finish(
        &self,
        server: &ServerConfig,
        service: RunningService<RoleClient, BackendClientHandler>,
        progress: watch::Receiver<u64>,
        stdio: Option<StdioSupervision>,
        crashed: Arc<AtomicBool>,
    ) -> ConnectedClient {
        ConnectedClient {
            server_uuid: server.uuid.clone(),
            server_name: server.name.clone(),
            peer: service.peer().clone(),
            peer_info: service.peer_info().cloned(),
            progress,
            service: Mutex::new(Some(service)),
            stdio,
            crashed,
            last_used: std::sync::Mutex::new(std::time::Instant::now()),
        }
    }
}

#[async_trait]
impl Connect for BackendConnector {
    type Client = ConnectedClient;

    /// Error-state guard, then up to `max_attempts` tries with a fixed
    /// backoff. The retry budget is per-connection; individual MCP requests
    /// are never retried here.
    async fn connect(
        &self,
        server: &ServerConfig,
        extra_headers: &HashMap<String, String>,
    ) -> Option<Arc<ConnectedClient>> {
        if let Some(probe) = &self.ctx.error_probe {
            if probe.is_errored(&server.uuid).await {
                tracing::warn!(
                    server = %server.name,
                    "skipping connection: backend flagged in error state"
                );
                return None;
            }
        }

        let attempts = self.ctx.settings.attempts_for(server.max_attempts);
        for attempt in 1..=attempts {
            match self.try_connect(server, extra_headers).await {
                Ok(client) => {
                    tracing::debug!(
                        server = %server.name,
                        transport = server.transport.label(),
                        attempt,
                        "backend connected"
                    );
                    return Some(Arc::new(client));
                }
                Err(error) => {
                    tracing::warn!(
                        server = %server.name,
                        attempt,
                        attempts,
                        error = %error,
                        "backend connection attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.ctx.retry_backoff).await;
                    }
                }
            }
        }

        tracing::error!(server = %server.name, attempts, "backend connection attempts exhausted");
        None
    }

    async fn close(&self, client: Arc<ConnectedClient>) {
        client.close().await;
    }
}

#[cfg(test)]
#[path = "connector_tests.rs"]
mod tests;
