use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// How often the eviction task scans the store.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Sessions older than this are dropped even if the transport never closed.
const MAX_SESSION_AGE: chrono::Duration = chrono::Duration::hours(24);

/// Generate a fresh upstream session id (ULID, sortable by creation time).
pub fn new_session_id() -> String {
    ulid::Ulid::new().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ApiKey,
    Oauth,
    None,
}

/// Metadata recorded for one upstream session at transport accept.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub namespace_uuid: String,
    pub endpoint_name: String,
    pub client_id: Option<String>,
    pub user_id: Option<String>,
    pub auth_method: AuthMethod,
    pub created_at: DateTime<Utc>,
    /// Upstream headers retained for forward-header backends, already scrubbed.
    #[serde(default)]
    pub forwardable_headers: HashMap<String, String>,
}

impl SessionInfo {
    pub fn new(
        session_id: impl Into<String>,
        namespace_uuid: impl Into<String>,
        endpoint_name: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            namespace_uuid: namespace_uuid.into(),
            endpoint_name: endpoint_name.into(),
            client_id: None,
            user_id: None,
            auth_method: AuthMethod::None,
            created_at: Utc::now(),
            forwardable_headers: HashMap::new(),
        }
    }
}

/// Process-wide `session_id -> SessionInfo` map.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<String, SessionInfo>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, info: SessionInfo) {
        self.inner.write().await.insert(info.session_id.clone(), info);
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.read().await.get(session_id).cloned()
    }

    pub async fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.inner.write().await.remove(session_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Drop sessions older than `max_age`; returns the evicted ids.
    pub async fn evict_older_than(&self, max_age: chrono::Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_age;
        let mut map = self.inner.write().await;
        let expired: Vec<String> = map
            .values()
            .filter(|info| info.created_at < cutoff)
            .map(|info| info.session_id.clone())
            .collect();
        for session_id in &expired {
            map.remove(session_id);
        }
        expired
    }

    /// Start the hourly TTL eviction loop. The returned token cancels it.
    pub fn spawn_eviction_task(self: &Arc<Self>) -> CancellationToken {
        let token = CancellationToken::new();
        let store = Arc::clone(self);
        let task_token = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so a fresh store is
            // not scanned at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.evict_older_than(MAX_SESSION_AGE).await;
                        if !evicted.is_empty() {
                            tracing::info!(count = evicted.len(), "evicted expired upstream sessions");
                        }
                    }
                }
            }
        });

        token
    }
}
