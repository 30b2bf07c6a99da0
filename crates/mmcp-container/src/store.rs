use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Stopped,
    /// Sticky: nothing recreates an errored container except an explicit
    /// retry command.
    Error,
}

/// Persisted record of one managed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSession {
    pub uuid: String,
    pub server_uuid: String,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub internal_url: Option<String>,
    pub status: ContainerStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl ContainerSession {
    pub fn new(server_uuid: impl Into<String>, max_retries: u32) -> Self {
        Self {
            uuid: ulid::Ulid::new().to_string(),
            server_uuid: server_uuid.into(),
            container_id: None,
            container_name: None,
            internal_url: None,
            status: ContainerStatus::Stopped,
            retry_count: 0,
            max_retries,
            last_retry_at: None,
            error_message: None,
        }
    }
}

/// Persistence seam for container sessions; the relational store plugs in
/// here, tests and single-process runs use [`MemoryStateStore`].
#[async_trait]
pub trait ContainerStateStore: Send + Sync {
    async fn upsert(&self, session: ContainerSession) -> Result<()>;

    async fn get_by_server(&self, server_uuid: &str) -> Result<Option<ContainerSession>>;

    async fn list(&self) -> Result<Vec<ContainerSession>>;

    async fn delete(&self, server_uuid: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStateStore {
    inner: RwLock<HashMap<String, ContainerSession>>,
}

impl MemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContainerStateStore for MemoryStateStore {
    async fn upsert(&self, session: ContainerSession) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(session.server_uuid.clone(), session);
        Ok(())
    }

    async fn get_by_server(&self, server_uuid: &str) -> Result<Option<ContainerSession>> {
        Ok(self.inner.read().await.get(server_uuid).cloned())
    }

    async fn list(&self) -> Result<Vec<ContainerSession>> {
        Ok(self.inner.read().await.values().cloned().collect())
    }

    async fn delete(&self, server_uuid: &str) -> Result<()> {
        self.inner.write().await.remove(server_uuid);
        Ok(())
    }
}
