//! Downstream client layer: per-backend MCP connections and the process-wide
//! session pool.
//!
//! The connector establishes one MCP client per `(upstream_session, backend)`
//! pair over stdio, SSE, or streamable HTTP, with a bounded retry budget and
//! crash detection for child processes. The pool coalesces concurrent
//! creations so each key yields exactly one live client.

mod connector;
mod headers;
mod logs;
mod pool;

pub use connector::{
    BackendConnector, ConnectContext, ConnectedClient, ConnectorError, CrashCallback,
    ErrorStateProbe,
};
pub use headers::{
    is_denied_header, sanitize_candidate_headers, sanitize_header_value, scrub_forward_headers,
    select_forward_headers,
};
pub use logs::{StderrLine, StderrLogStore};
pub use pool::{ClientPool, Connect, McpClientPool, PoolKey};
