//! Upstream transport intake: per-endpoint SSE and streamable-HTTP routes,
//! authentication, and session lifecycle wiring.

mod auth;
mod server;
mod sse;

pub use auth::{AuthContext, AuthError, AuthResolver, OpenResolver, StaticKeyResolver};
pub use server::{EndpointServer, GatewayState};
pub use sse::SseRegistry;
