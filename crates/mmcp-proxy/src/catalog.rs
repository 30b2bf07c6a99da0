use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use mmcp_config::ToolOverride;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

/// Row shape of the external tool catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogTool {
    pub name: String,
    pub description: Option<String>,
    pub schema: serde_json::Value,
}

/// External catalog store contract: upsert keyed on `(server_uuid, name)`,
/// then prune names that disappeared.
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn upsert_tools(&self, server_uuid: &str, tools: &[CatalogTool]) -> Result<()>;

    async fn delete_absent(&self, server_uuid: &str, kept_names: &[String]) -> Result<()>;
}

/// In-memory catalog used in tests and single-process deployments.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<HashMap<String, HashMap<String, CatalogTool>>>,
    upsert_calls: Mutex<usize>,
}

impl MemoryCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn names_for(&self, server_uuid: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .await
            .get(server_uuid)
            .map(|tools| tools.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// How many upsert batches ran; lets tests assert fingerprint gating.
    pub fn upsert_calls(&self) -> usize {
        *self.upsert_calls.lock().expect("catalog counter poisoned")
    }
}

#[async_trait]
impl ToolCatalog for MemoryCatalog {
    async fn upsert_tools(&self, server_uuid: &str, tools: &[CatalogTool]) -> Result<()> {
        *self.upsert_calls.lock().expect("catalog counter poisoned") += 1;
        let mut inner = self.inner.write().await;
        let entry = inner.entry(server_uuid.to_string()).or_default();
        for tool in tools {
            entry.insert(tool.name.clone(), tool.clone());
        }
        Ok(())
    }

    async fn delete_absent(&self, server_uuid: &str, kept_names: &[String]) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(server_uuid) {
            entry.retain(|name, _| kept_names.iter().any(|kept| kept == name));
        }
        Ok(())
    }
}

/// Tracks the per-backend hash of the sorted original tool-name set so the
/// catalog is only written when the set actually changed.
#[derive(Default)]
pub struct FingerprintTracker {
    inner: Mutex<HashMap<String, [u8; 32]>>,
}

impl FingerprintTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stable digest over the sorted name set; permutations hash equal.
    pub fn fingerprint(names: &[String]) -> [u8; 32] {
        let mut sorted: Vec<&str> = names.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut hasher = Sha256::new();
        for name in sorted {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.finalize().into()
    }

    /// Record the fingerprint; returns true when it differs from the last
    /// recorded value (i.e. a catalog sync is due).
    pub fn update(&self, server_uuid: &str, fingerprint: [u8; 32]) -> bool {
        let mut inner = self.inner.lock().expect("fingerprint map poisoned");
        match inner.get(server_uuid) {
            Some(existing) if *existing == fingerprint => false,
            _ => {
                inner.insert(server_uuid.to_string(), fingerprint);
                true
            }
        }
    }
}

/// Drop tool names that an enabled override maps some *other* original onto;
/// writing both would collide on `(server_uuid, name)`.
pub fn filter_override_shadowed(
    names: Vec<String>,
    server_uuid: &str,
    overrides: &[ToolOverride],
) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| {
            !overrides.iter().any(|entry| {
                entry.enabled
                    && entry.server_uuid == server_uuid
                    && entry.override_name.as_deref() == Some(name.as_str())
                    && entry.original_name != *name
            })
        })
        .collect()
}
