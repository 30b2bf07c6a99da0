use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

/// Transport configuration for a downstream backend server.
///
/// Serialized with a `type` tag so TOML reads `type = "stdio"` etc.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum BackendTransport {
    /// Spawn a child process communicating over stdio (JSON-RPC on stdin/stdout).
    #[serde(rename = "stdio")]
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Connect to a remote MCP server via legacy SSE transport.
    #[serde(rename = "sse")]
    Sse { url: String },
    /// Connect to a remote MCP server via Streamable HTTP.
    #[serde(rename = "streamable_http")]
    StreamableHttp { url: String },
}

impl BackendTransport {
    /// Short human-readable label for the transport type.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// One downstream backend server.
///
/// `name` is user-assigned and doubles as the tool-name mangling prefix; the
/// `uuid` is the stable identity used by namespaces, the pool, and the
/// container supervisor.
///
/// # TOML formats
///
/// **Tagged (canonical):**
/// ```toml
/// [[servers]]
/// uuid = "srv-1"
/// name = "math"
/// type = "stdio"
/// command = "npx"
/// args = ["-y", "math-mcp"]
///
/// [[servers]]
/// uuid = "srv-2"
/// name = "weather"
/// type = "streamable_http"
/// url = "https://mcp.example.com/mcp"
/// ```
///
/// **Legacy (auto-detected as stdio when `command` is present):**
/// ```toml
/// [[servers]]
/// uuid = "srv-1"
/// name = "math"
/// command = "npx"
/// args = ["-y", "math-mcp"]
/// ```
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub uuid: String,
    pub name: String,
    #[serde(flatten)]
    pub transport: BackendTransport,
    /// Headers always attached to SSE/streamable-HTTP requests.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub static_headers: HashMap<String, String>,
    /// Upstream request headers copied onto downstream requests, subject to
    /// the deny-list scrub.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward_headers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
    /// OAuth access token; preferred over `bearer_token` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_access_token: Option<String>,
    /// Per-server override of the connection retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl ServerConfig {
    /// Returns true if this server uses stdio transport.
    pub fn is_stdio(&self) -> bool {
        matches!(&self.transport, BackendTransport::Stdio { .. })
    }

    /// The auth token to send downstream, OAuth access token winning over a
    /// static bearer token.
    pub fn auth_token(&self) -> Option<&str> {
        self.oauth_access_token
            .as_deref()
            .or(self.bearer_token.as_deref())
    }

    /// Stdio `env` with `${NAME}` placeholders resolved from the gateway
    /// process environment.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        match &self.transport {
            BackendTransport::Stdio { env, .. } => env
                .iter()
                .map(|(key, value)| {
                    (
                        key.clone(),
                        resolve_env_placeholders(value, |name| std::env::var(name).ok()),
                    )
                })
                .collect(),
            _ => HashMap::new(),
        }
    }
}

/// Custom deserializer keeping the legacy untagged stdio format working.
///
/// 1. Explicit `type` field: deserialize the matching transport variant.
/// 2. No `type` field + `command` present: auto-detect as `Stdio`.
/// 3. Neither: error with a pointer to the expected shape.
impl<'de> Deserialize<'de> for ServerConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            uuid: String,
            name: String,
            #[serde(rename = "type")]
            transport_type: Option<String>,
            // Stdio fields
            command: Option<String>,
            #[serde(default)]
            args: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            // Sse/StreamableHttp fields
            url: Option<String>,
            // Common
            #[serde(default)]
            static_headers: HashMap<String, String>,
            #[serde(default)]
            forward_headers: Vec<String>,
            bearer_token: Option<String>,
            oauth_access_token: Option<String>,
            max_attempts: Option<u32>,
        }

        let raw = Raw::deserialize(deserializer)?;

        let require_url = |kind: &str, url: Option<String>| {
            url.ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "server '{}': type = \"{kind}\" requires 'url' field",
                    raw.name
                ))
            })
        };

        let transport = match raw.transport_type.as_deref() {
            Some("stdio") => {
                let command = raw.command.clone().ok_or_else(|| {
                    serde::de::Error::custom(format!(
                        "server '{}': type = \"stdio\" requires 'command' field",
                        raw.name
                    ))
                })?;
                BackendTransport::Stdio {
                    command,
                    args: raw.args,
                    env: raw.env,
                }
            }
            Some("sse") => BackendTransport::Sse {
                url: require_url("sse", raw.url)?,
            },
            Some("streamable_http") => BackendTransport::StreamableHttp {
                url: require_url("streamable_http", raw.url)?,
            },
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "server '{}': unknown transport type '{}' (expected: stdio, sse, streamable_http)",
                    raw.name, other
                )));
            }
            None => {
                if let Some(command) = raw.command.clone() {
                    BackendTransport::Stdio {
                        command,
                        args: raw.args,
                        env: raw.env,
                    }
                } else {
                    return Err(serde::de::Error::custom(format!(
                        "server '{}': missing 'type' field; \
                         add type = \"stdio\" (with 'command') or \
                         type = \"sse\"/\"streamable_http\" (with 'url')",
                        raw.name
                    )));
                }
            }
        };

        Ok(ServerConfig {
            uuid: raw.uuid,
            name: raw.name,
            transport,
            static_headers: raw.static_headers,
            forward_headers: raw.forward_headers,
            bearer_token: raw.bearer_token,
            oauth_access_token: raw.oauth_access_token,
            max_attempts: raw.max_attempts,
        })
    }
}

/// Substitute `${NAME}` placeholders in a backend env value.
///
/// Names that do not resolve pass through unchanged, including the braces.
pub fn resolve_env_placeholders(
    value: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(resolved) => out.push_str(&resolved),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Rewrite a loopback host to `host.docker.internal`.
///
/// Used when the gateway itself runs in a container and backend URLs point at
/// the operator's machine. Only the authority component is touched.
pub fn transform_localhost_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let (scheme, after) = url.split_at(scheme_end + 3);
    let authority_end = after.find('/').unwrap_or(after.len());
    let (authority, path) = after.split_at(authority_end);

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (authority, None),
    };

    if host != "localhost" && host != "127.0.0.1" {
        return url.to_string();
    }

    let mut out = String::with_capacity(url.len() + 16);
    out.push_str(scheme);
    out.push_str("host.docker.internal");
    if let Some(port) = port {
        out.push(':');
        out.push_str(port);
    }
    out.push_str(path);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_stdio_round_trips() {
        let parsed: ServerConfig = toml::from_str(
            r#"
uuid = "srv-1"
name = "math"
type = "stdio"
command = "npx"
args = ["-y", "math-mcp"]
env = { API_KEY = "${MATH_KEY}" }
"#,
        )
        .unwrap();

        assert!(parsed.is_stdio());
        assert_eq!(parsed.name, "math");
        match &parsed.transport {
            BackendTransport::Stdio { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args, &["-y", "math-mcp"]);
                assert_eq!(env.get("API_KEY").unwrap(), "${MATH_KEY}");
            }
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn legacy_format_auto_detects_stdio() {
        let parsed: ServerConfig = toml::from_str(
            r#"
uuid = "srv-1"
name = "math"
command = "npx"
"#,
        )
        .unwrap();
        assert!(parsed.is_stdio());
    }

    #[test]
    fn missing_command_and_type_fails() {
        let err = toml::from_str::<ServerConfig>(
            r#"
uuid = "srv-1"
name = "bad"
url = "https://example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing 'type' field"));
    }

    #[test]
    fn http_transport_requires_url() {
        let err = toml::from_str::<ServerConfig>(
            r#"
uuid = "srv-1"
name = "bad"
type = "streamable_http"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires 'url' field"));
    }

    #[test]
    fn unknown_type_fails() {
        let err = toml::from_str::<ServerConfig>(
            r#"
uuid = "srv-1"
name = "bad"
type = "websocket"
url = "wss://example.com"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown transport type"));
    }

    #[test]
    fn oauth_token_wins_over_bearer() {
        let parsed: ServerConfig = toml::from_str(
            r#"
uuid = "srv-2"
name = "remote"
type = "sse"
url = "https://example.com/sse"
bearer_token = "static"
oauth_access_token = "oauth"
"#,
        )
        .unwrap();
        assert_eq!(parsed.auth_token(), Some("oauth"));
    }

    #[test]
    fn placeholders_resolve_from_lookup() {
        let resolved = resolve_env_placeholders("${HOME}/bin:${MISSING}:tail", |name| {
            (name == "HOME").then(|| "/home/u".to_string())
        });
        assert_eq!(resolved, "/home/u/bin:${MISSING}:tail");
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        let resolved = resolve_env_placeholders("${OOPS", |_| Some("x".to_string()));
        assert_eq!(resolved, "${OOPS");
    }

    #[test]
    fn localhost_url_is_rewritten_with_port() {
        assert_eq!(
            transform_localhost_url("http://localhost:8080/sse"),
            "http://host.docker.internal:8080/sse"
        );
        assert_eq!(
            transform_localhost_url("https://127.0.0.1/mcp"),
            "https://host.docker.internal/mcp"
        );
    }

    #[test]
    fn non_loopback_urls_are_untouched() {
        assert_eq!(
            transform_localhost_url("https://mcp.example.com/localhost"),
            "https://mcp.example.com/localhost"
        );
        assert_eq!(transform_localhost_url("not a url"), "not a url");
    }
}
