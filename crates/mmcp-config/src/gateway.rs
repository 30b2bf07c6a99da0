use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::server::ServerConfig;

/// Membership status of a server inside a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceMember {
    pub server_uuid: String,
    #[serde(default = "default_member_status")]
    pub status: MemberStatus,
}

fn default_member_status() -> MemberStatus {
    MemberStatus::Active
}

/// A namespace groups backend servers and is exposed as one virtual MCP server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceConfig {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub servers: Vec<NamespaceMember>,
}

/// Public endpoint name bound to a namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub namespace_uuid: String,
}

/// Per-namespace rename/disable entry for a single tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolOverride {
    pub namespace_uuid: String,
    pub server_uuid: String,
    pub original_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_override: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Full static gateway configuration, normally `metamcp.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub overrides: Vec<ToolOverride>,
}

impl GatewayConfig {
    /// Load config from an explicit path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read gateway config: {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse gateway config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs with dangling references so failures surface at startup
    /// instead of on the first request.
    pub fn validate(&self) -> Result<()> {
        let server_uuids: HashMap<&str, &ServerConfig> = self
            .servers
            .iter()
            .map(|server| (server.uuid.as_str(), server))
            .collect();

        for namespace in &self.namespaces {
            for member in &namespace.servers {
                if !server_uuids.contains_key(member.server_uuid.as_str()) {
                    anyhow::bail!(
                        "namespace '{}' references unknown server uuid '{}'",
                        namespace.name,
                        member.server_uuid
                    );
                }
            }
        }

        let namespace_uuids: Vec<&str> = self
            .namespaces
            .iter()
            .map(|namespace| namespace.uuid.as_str())
            .collect();
        for endpoint in &self.endpoints {
            if !namespace_uuids.contains(&endpoint.namespace_uuid.as_str()) {
                anyhow::bail!(
                    "endpoint '{}' references unknown namespace uuid '{}'",
                    endpoint.name,
                    endpoint.namespace_uuid
                );
            }
        }

        Ok(())
    }

    pub fn server(&self, uuid: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.uuid == uuid)
    }

    pub fn namespace(&self, uuid: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|namespace| namespace.uuid == uuid)
    }

    pub fn endpoint(&self, name: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|endpoint| endpoint.name == name)
    }

    /// Active backend servers of a namespace, in declaration order.
    pub fn active_servers(&self, namespace_uuid: &str) -> Vec<&ServerConfig> {
        let Some(namespace) = self.namespace(namespace_uuid) else {
            return Vec::new();
        };
        namespace
            .servers
            .iter()
            .filter(|member| member.status == MemberStatus::Active)
            .filter_map(|member| self.server(&member.server_uuid))
            .collect()
    }

    /// Override entries scoped to one namespace.
    pub fn overrides_for(&self, namespace_uuid: &str) -> Vec<&ToolOverride> {
        self.overrides
            .iter()
            .filter(|entry| entry.namespace_uuid == namespace_uuid)
            .collect()
    }
}
