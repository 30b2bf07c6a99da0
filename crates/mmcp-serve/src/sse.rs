use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::Extension;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Sink, SinkExt, Stream, StreamExt};
use mmcp_pool::sanitize_candidate_headers;
use mmcp_proxy::ProxySession;
use mmcp_session::{SessionInfo, new_session_id};
use rmcp::RoleServer;
use rmcp::model::ClientJsonRpcMessage;
use rmcp::service::{RxJsonRpcMessage, TxJsonRpcMessage, serve_directly_with_ct};
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

use crate::auth::AuthContext;
use crate::server::GatewayState;

const CHANNEL_CAPACITY: usize = 64;

/// Live SSE sessions: the POST side looks up the inbound channel here.
#[derive(Default)]
pub struct SseRegistry {
    txs: RwLock<HashMap<String, mpsc::Sender<ClientJsonRpcMessage>>>,
}

impl SseRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, session_id: &str, tx: mpsc::Sender<ClientJsonRpcMessage>) {
        self.txs.write().await.insert(session_id.to_string(), tx);
    }

    pub async fn sender(&self, session_id: &str) -> Option<mpsc::Sender<ClientJsonRpcMessage>> {
        self.txs.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) {
        self.txs.write().await.remove(session_id);
    }

    pub async fn len(&self) -> usize {
        self.txs.read().await.len()
    }
}

/// Bridges one SSE connection to the rmcp service: inbound frames arrive via
/// the POST endpoint's channel, outbound frames flow to the event stream.
struct SseSessionTransport {
    stream: ReceiverStream<RxJsonRpcMessage<RoleServer>>,
    sink: PollSender<TxJsonRpcMessage<RoleServer>>,
    session_id: String,
    registry: Arc<SseRegistry>,
}

impl Sink<TxJsonRpcMessage<RoleServer>> for SseSessionTransport {
    type Error = std::io::Error;

    fn poll_ready(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.sink.poll_ready_unpin(cx).map_err(std::io::Error::other)
    }

    fn start_send(
        mut self: std::pin::Pin<&mut Self>,
        item: TxJsonRpcMessage<RoleServer>,
    ) -> Result<(), Self::Error> {
        self.sink.start_send_unpin(item).map_err(std::io::Error::other)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.sink.poll_flush_unpin(cx).map_err(std::io::Error::other)
    }

    fn poll_close(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        let result = self.sink.poll_close_unpin(cx).map_err(std::io::Error::other);
        if result.is_ready() {
            let session_id = self.session_id.clone();
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                registry.remove(&session_id).await;
            });
        }
        result
    }
}

impl Stream for SseSessionTransport {
    type Item = RxJsonRpcMessage<RoleServer>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}

fn headers_to_multimap(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

/// `GET /{endpoint}/sse`: open an SSE MCP session.
///
/// The response stream starts with an `endpoint` event pointing at the
/// message POST URL for this session.
pub(crate) async fn sse_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint): Path<String>,
    Extension(auth): Extension<AuthContext>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, StatusCode> {
    let Some(endpoint_config) = state.services.config.endpoint(&endpoint) else {
        return Err(StatusCode::NOT_FOUND);
    };
    let namespace_uuid = endpoint_config.namespace_uuid.clone();
    let session_id = new_session_id();

    // Scrub once at accept; forward-header backends draw from this set.
    let candidates = sanitize_candidate_headers(&headers_to_multimap(&headers));

    let mut info = SessionInfo::new(session_id.clone(), namespace_uuid.clone(), endpoint.clone());
    info.client_id = auth.client_id;
    info.user_id = auth.user_id;
    info.auth_method = auth.auth_method;
    info.forwardable_headers = candidates.clone();
    state.sessions.insert(info).await;

    let (from_client_tx, from_client_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (to_client_tx, to_client_rx) =
        mpsc::channel::<TxJsonRpcMessage<RoleServer>>(CHANNEL_CAPACITY);
    state.sse.register(&session_id, from_client_tx).await;

    let transport = SseSessionTransport {
        stream: ReceiverStream::new(from_client_rx),
        sink: PollSender::new(to_client_tx),
        session_id: session_id.clone(),
        registry: Arc::clone(&state.sse),
    };

    let proxy = ProxySession::new(
        Arc::clone(&state.services),
        namespace_uuid,
        session_id.clone(),
        candidates,
    );

    let connection_token = state.shutdown.child_token();
    let running = serve_directly_with_ct(proxy, transport, None, connection_token.clone());

    // Lifetime expiry and explicit close both land here: cancel the service,
    // which closes the transport and unwinds the teardown task below.
    {
        let close_token = connection_token.clone();
        state
            .lifetimes
            .register(&session_id, move || {
                Box::pin(async move {
                    close_token.cancel();
                })
            })
            .await;
    }

    {
        let state = Arc::clone(&state);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            let _ = running.waiting().await;
            state.sse.remove(&session_id).await;
            state.services.pool.cleanup_session(&session_id).await;
            state.sessions.remove(&session_id).await;
            state.lifetimes.close(&session_id).await;
            tracing::debug!(session_id = %session_id, "sse session torn down");
        });
    }

    tracing::info!(endpoint = %endpoint, session_id = %session_id, "sse session accepted");

    let endpoint_event = futures::stream::once({
        let data = format!("/{endpoint}/message?sessionId={session_id}");
        async move { Ok::<_, Infallible>(Event::default().event("endpoint").data(data)) }
    });
    let message_events = ReceiverStream::new(to_client_rx).filter_map(|message| async move {
        match serde_json::to_string(&message) {
            Ok(json) => Some(Ok::<_, Infallible>(Event::default().event("message").data(json))),
            Err(error) => {
                tracing::error!(error = %error, "failed to serialize outbound frame");
                None
            }
        }
    });

    Ok(Sse::new(endpoint_event.chain(message_events)).keep_alive(KeepAlive::default()))
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PostEventQuery {
    pub session_id: String,
}

/// `POST /{endpoint}/message?sessionId=<id>`: upstream-to-server frames.
pub(crate) async fn post_message_handler(
    State(state): State<Arc<GatewayState>>,
    Path(endpoint): Path<String>,
    Query(query): Query<PostEventQuery>,
    axum::Json(message): axum::Json<ClientJsonRpcMessage>,
) -> StatusCode {
    if state.services.config.endpoint(&endpoint).is_none() {
        return StatusCode::NOT_FOUND;
    }
    let Some(tx) = state.sse.sender(&query.session_id).await else {
        return StatusCode::NOT_FOUND;
    };
    match tx.send(message).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::GONE,
    }
}
