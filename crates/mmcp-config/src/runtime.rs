use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 86_400_000;
const DEFAULT_MAX_TOTAL_TIMEOUT_MS: u64 = 86_400_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 1;

/// Runtime knobs read from the gateway process environment.
///
/// Recognized keys: `MCP_TIMEOUT`, `MCP_MAX_TOTAL_TIMEOUT` (both in
/// milliseconds), `MCP_RESET_TIMEOUT_ON_PROGRESS`, `MCP_MAX_ATTEMPTS`,
/// `SESSION_LIFETIME` (milliseconds, unset = infinite), and
/// `TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Per-request timeout for `tools/call` and `prompts/get`.
    pub request_timeout: Duration,
    /// Hard deadline across progress resets.
    pub max_total_timeout: Duration,
    /// Restart the per-request timer on each progress notification.
    pub reset_timeout_on_progress: bool,
    /// Default connection retry budget; per-server config overrides it.
    pub max_attempts: u32,
    /// Upstream session lifetime; `None` means sessions live until close.
    pub session_lifetime: Option<Duration>,
    /// Rewrite loopback backend URLs to `host.docker.internal`.
    pub transform_localhost: bool,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            max_total_timeout: Duration::from_millis(DEFAULT_MAX_TOTAL_TIMEOUT_MS),
            reset_timeout_on_progress: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            session_lifetime: None,
            transform_localhost: false,
        }
    }
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Parametrized over the lookup so tests avoid touching process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: parse_millis(&lookup, "MCP_TIMEOUT")
                .unwrap_or(defaults.request_timeout),
            max_total_timeout: parse_millis(&lookup, "MCP_MAX_TOTAL_TIMEOUT")
                .unwrap_or(defaults.max_total_timeout),
            reset_timeout_on_progress: parse_bool(&lookup, "MCP_RESET_TIMEOUT_ON_PROGRESS")
                .unwrap_or(defaults.reset_timeout_on_progress),
            max_attempts: parse_u32(&lookup, "MCP_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            session_lifetime: parse_millis(&lookup, "SESSION_LIFETIME"),
            transform_localhost: parse_bool(&lookup, "TRANSFORM_LOCALHOST_TO_DOCKER_INTERNAL")
                .unwrap_or(defaults.transform_localhost),
        }
    }

    /// Retry budget for one server, honoring its `max_attempts` override.
    pub fn attempts_for(&self, server_override: Option<u32>) -> u32 {
        server_override.unwrap_or(self.max_attempts).max(1)
    }
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable duration setting");
            None
        }
    }
}

fn parse_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable numeric setting");
            None
        }
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring unparseable boolean setting");
            None
        }
    }
}
