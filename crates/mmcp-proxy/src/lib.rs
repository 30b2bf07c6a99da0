//! The aggregation proxy: serves the MCP protocol upstream, fans requests out
//! to the backends of a namespace, and merges results under
//! namespace-qualified names.

mod catalog;
mod middleware;
mod naming;
mod session;
mod timeouts;

pub use catalog::{CatalogTool, FingerprintTracker, MemoryCatalog, ToolCatalog};
pub use middleware::{
    CallDecision, ConfigOverrideProvider, FilterToolsMiddleware, MiddlewareCache, MiddlewareChain,
    OverrideProvider, OverrideTable, ToolMiddleware, ToolOverridesMiddleware,
};
pub use naming::{mangle, sanitize, split_mangled};
pub use session::{ProxyServices, ProxySession, unified_server_name};
pub use timeouts::TimeoutPolicy;
