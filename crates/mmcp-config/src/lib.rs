//! Configuration model for the MetaMCP gateway.
//!
//! Covers the static gateway config (backend servers, namespaces, endpoints,
//! tool overrides) and the runtime settings read from the process environment.

mod gateway;
mod runtime;
mod server;

pub use gateway::{
    EndpointConfig, GatewayConfig, MemberStatus, NamespaceConfig, NamespaceMember, ToolOverride,
};
pub use runtime::RuntimeSettings;
pub use server::{
    BackendTransport, ServerConfig, resolve_env_placeholders, transform_localhost_url,
};
