use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use mmcp_config::EndpointConfig;
use mmcp_container::{ContainerStateStore, ContainerSupervisor};
use mmcp_pool::StderrLogStore;
use mmcp_proxy::{ProxyServices, ProxySession};
use mmcp_session::{LifetimeManager, SessionStore, new_session_id};
use rmcp::transport::StreamableHttpServerConfig;
use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
use rmcp::transport::streamable_http_server::tower::StreamableHttpService;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthResolver;
use crate::sse::{self, SseRegistry};

const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_LOG_TAIL: usize = 100;

/// Everything the endpoint routes need, shared across connections.
pub struct GatewayState {
    pub services: Arc<ProxyServices>,
    pub sessions: Arc<SessionStore>,
    pub lifetimes: Arc<LifetimeManager>,
    pub auth: Arc<dyn AuthResolver>,
    pub sse: Arc<SseRegistry>,
    pub supervisor: Option<Arc<ContainerSupervisor>>,
    pub log_store: Arc<StderrLogStore>,
    pub shutdown: CancellationToken,
}

impl GatewayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services: Arc<ProxyServices>,
        sessions: Arc<SessionStore>,
        lifetimes: Arc<LifetimeManager>,
        auth: Arc<dyn AuthResolver>,
        supervisor: Option<Arc<ContainerSupervisor>>,
        log_store: Arc<StderrLogStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            services,
            sessions,
            lifetimes,
            auth,
            sse: SseRegistry::new(),
            supervisor,
            log_store,
            shutdown: CancellationToken::new(),
        })
    }
}

async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    match state
        .auth
        .resolve(bearer.as_deref(), api_key.as_deref())
        .await
    {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

fn streamable_service(
    state: &Arc<GatewayState>,
    endpoint: EndpointConfig,
) -> StreamableHttpService<ProxySession, LocalSessionManager> {
    let services = Arc::clone(&state.services);
    StreamableHttpService::new(
        move || {
            Ok(ProxySession::new(
                Arc::clone(&services),
                endpoint.namespace_uuid.clone(),
                new_session_id(),
                HashMap::new(),
            ))
        },
        Default::default(),
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: None,
            cancellation_token: state.shutdown.child_token(),
        },
    )
}

/// Build the upstream router: per-endpoint SSE, message, and streamable-HTTP
/// routes plus the container admin surface, all behind the auth resolver.
pub fn router(state: Arc<GatewayState>) -> Router {
    let routed = Router::new()
        .route("/{endpoint}/sse", get(sse::sse_handler))
        .route("/{endpoint}/message", post(sse::post_message_handler))
        .route("/admin/status", get(gateway_status_handler))
        .route("/admin/servers/{uuid}/retry", post(retry_container_handler))
        .route("/admin/servers/{uuid}/logs", get(server_logs_handler))
        .with_state(Arc::clone(&state));

    let mut app = routed;
    for endpoint in state.services.config.endpoints.clone() {
        let path = format!("/{}/mcp", endpoint.name);
        app = app.nest_service(&path, streamable_service(&state, endpoint));
    }

    app.layer(axum::middleware::from_fn_with_state(state, auth_middleware))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
}

/// `GET /admin/status`: liveness plus aggregate session and backend counts.
async fn gateway_status_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let endpoints: Vec<String> = state
        .services
        .config
        .endpoints
        .iter()
        .map(|endpoint| endpoint.name.clone())
        .collect();

    let mut containers = serde_json::Value::Null;
    if let Some(supervisor) = &state.supervisor {
        match supervisor.store().list().await {
            Ok(sessions) => {
                let rows: Vec<serde_json::Value> = sessions
                    .iter()
                    .map(|session| {
                        json!({
                            "serverUuid": session.server_uuid,
                            "status": session.status,
                            "retryCount": session.retry_count,
                        })
                    })
                    .collect();
                containers = json!(rows);
            }
            Err(error) => {
                tracing::warn!(error = %error, "container state listing failed");
            }
        }
    }

    axum::Json(json!({
        "running": true,
        "endpoints": endpoints,
        "sessions": state.sessions.len().await,
        "sseSessions": state.sse.len().await,
        "pooledClients": state.services.pool.len().await,
        "containers": containers,
    }))
    .into_response()
}

/// `POST /admin/servers/{uuid}/retry`: operator-initiated recovery from the
/// sticky container error state.
async fn retry_container_handler(
    State(state): State<Arc<GatewayState>>,
    Path(uuid): Path<String>,
) -> Response {
    let Some(supervisor) = &state.supervisor else {
        return (
            StatusCode::CONFLICT,
            axum::Json(json!({"error": "container supervision is not enabled"})),
        )
            .into_response();
    };
    let Some(server) = state.services.config.server(&uuid).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match supervisor.retry_container(&server).await {
        Ok(url) => axum::Json(json!({"url": url})).into_response(),
        Err(error) => (
            StatusCode::BAD_GATEWAY,
            axum::Json(json!({"error": error.to_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
struct LogsQuery {
    #[serde(default = "default_log_tail")]
    n: usize,
}

fn default_log_tail() -> usize {
    DEFAULT_LOG_TAIL
}

/// `GET /admin/servers/{uuid}/logs?n=<count>`: container logs when the
/// supervisor is active, otherwise the stderr ring buffer.
async fn server_logs_handler(
    State(state): State<Arc<GatewayState>>,
    Path(uuid): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    if let Some(supervisor) = &state.supervisor {
        return match supervisor.tail_logs(&uuid, query.n).await {
            Ok(lines) => axum::Json(json!({"lines": lines})).into_response(),
            Err(error) => (
                StatusCode::NOT_FOUND,
                axum::Json(json!({"error": error.to_string()})),
            )
                .into_response(),
        };
    }

    let lines: Vec<String> = state
        .log_store
        .tail(Some(&uuid), query.n)
        .into_iter()
        .map(|entry| format!("{} {}", entry.timestamp.to_rfc3339(), entry.line))
        .collect();
    axum::Json(json!({"lines": lines})).into_response()
}

/// The bound HTTP listener serving all endpoint routes.
pub struct EndpointServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl EndpointServer {
    pub async fn start(state: Arc<GatewayState>, bind: SocketAddr) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind)
            .await
            .with_context(|| format!("failed to bind endpoint server at {bind}"))?;
        let addr = listener
            .local_addr()
            .context("failed to resolve endpoint server address")?;

        let shutdown = state.shutdown.clone();
        let app = router(state);

        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "endpoint server stopped with error");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            server_task,
        })
    }

    /// Stop accepting and tear down; live sessions are cancelled through the
    /// shared token.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "endpoint server join failed");
        }
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
