use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use mmcp_config::ServerConfig;
use tokio::sync::{Mutex, OnceCell};

use crate::connector::BackendConnector;
use crate::headers::select_forward_headers;

/// Connection factory seam; production uses [`BackendConnector`], tests
/// substitute counting fakes.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Establish a client or give up (`None`); retry policy lives inside.
    async fn connect(
        &self,
        server: &ServerConfig,
        extra_headers: &HashMap<String, String>,
    ) -> Option<Arc<Self::Client>>;

    async fn close(&self, client: Arc<Self::Client>);
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub session_id: String,
    pub server_uuid: String,
}

type Slot<C> = Arc<OnceCell<Option<Arc<C>>>>;

/// Process-wide pool of downstream clients keyed by
/// `(upstream_session, backend_server)`.
///
/// Creation is coalesced per key: concurrent `get_session` calls for the same
/// key run the connector exactly once and all observe the same client.
pub struct ClientPool<F: Connect> {
    connector: Arc<F>,
    inner: Mutex<HashMap<PoolKey, Slot<F::Client>>>,
}

/// The production pool over real backend connections.
pub type McpClientPool = ClientPool<BackendConnector>;

impl<F: Connect> ClientPool<F> {
    pub fn new(connector: Arc<F>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            inner: Mutex::new(HashMap::new()),
        })
    }

    /// Return the existing client for the key, creating it on first use.
    ///
    /// `candidate_headers` is the session's sanitized upstream header set;
    /// the subset named by the server's `forward_headers` rides along on the
    /// downstream transport.
    pub async fn get_session(
        &self,
        session_id: &str,
        server: &ServerConfig,
        candidate_headers: &HashMap<String, String>,
    ) -> Option<Arc<F::Client>> {
        let key = PoolKey {
            session_id: session_id.to_string(),
            server_uuid: server.uuid.clone(),
        };

        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let extra_headers = select_forward_headers(candidate_headers, &server.forward_headers);
        let client = slot
            .get_or_init(|| self.connector.connect(server, &extra_headers))
            .await
            .clone();

        if client.is_none() {
            // A failed creation must not pin the key; the next request may
            // retry from scratch.
            let mut map = self.inner.lock().await;
            if let Some(existing) = map.get(&key) {
                if Arc::ptr_eq(existing, &slot) {
                    map.remove(&key);
                }
            }
        }

        client
    }

    /// Create missing clients for every listed server, independently and
    /// best-effort.
    pub async fn ensure_for(
        &self,
        session_id: &str,
        servers: &[ServerConfig],
        candidate_headers: &HashMap<String, String>,
    ) {
        for server in servers {
            if self
                .get_session(session_id, server, candidate_headers)
                .await
                .is_none()
            {
                tracing::warn!(server = %server.name, "ensure_for could not establish client");
            }
        }
    }

    /// Close every client of a server and recreate each with new parameters.
    pub async fn invalidate(
        &self,
        server_uuid: &str,
        new_params: &ServerConfig,
        candidate_headers: &HashMap<String, String>,
    ) {
        let removed = self.take_matching(|key| key.server_uuid == server_uuid).await;
        let sessions: Vec<String> = removed.iter().map(|(key, _)| key.session_id.clone()).collect();
        self.close_slots(removed).await;

        for session_id in sessions {
            if self
                .get_session(&session_id, new_params, candidate_headers)
                .await
                .is_none()
            {
                tracing::warn!(
                    server = %new_params.name,
                    session_id = %session_id,
                    "invalidate could not re-establish client"
                );
            }
        }
    }

    /// Close and drop every client of a server without recreation.
    pub async fn remove(&self, server_uuid: &str) {
        let removed = self.take_matching(|key| key.server_uuid == server_uuid).await;
        self.close_slots(removed).await;
    }

    /// Drop every downstream client belonging to one upstream session.
    pub async fn cleanup_session(&self, session_id: &str) {
        let removed = self.take_matching(|key| key.session_id == session_id).await;
        self.close_slots(removed).await;
    }

    /// Close everything; used at shutdown.
    pub async fn cleanup_all(&self) {
        let removed = self.take_matching(|_| true).await;
        self.close_slots(removed).await;
    }

    /// Live (successfully created) client count, for diagnostics.
    pub async fn len(&self) -> usize {
        let map = self.inner.lock().await;
        map.values()
            .filter(|slot| matches!(slot.get(), Some(Some(_))))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn take_matching(
        &self,
        predicate: impl Fn(&PoolKey) -> bool,
    ) -> Vec<(PoolKey, Slot<F::Client>)> {
        let mut map = self.inner.lock().await;
        let keys: Vec<PoolKey> = map.keys().filter(|key| predicate(key)).cloned().collect();
        keys.into_iter()
            .filter_map(|key| map.remove(&key).map(|slot| (key, slot)))
            .collect()
    }

    async fn close_slots(&self, slots: Vec<(PoolKey, Slot<F::Client>)>) {
        for (_, slot) in slots {
            if let Some(Some(client)) = slot.get() {
                self.connector.close(Arc::clone(client)).await;
            }
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
