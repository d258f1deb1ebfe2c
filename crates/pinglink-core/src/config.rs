//! Process-wide configuration, read from the environment once at startup.
//!
//! Components never read ambient state mid-operation: everything they need
//! is captured in these structs before the first connection attempt.

use std::env;
use std::time::Duration;

use uuid::Uuid;

/// Identity an agent attaches to every outbound call or stream.
///
/// Immutable for the process lifetime; the id stays stable across
/// reconnects so the server can correlate sessions from the same agent.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub id: String,
    pub version: String,
}

/// Read-only identity shared by every server-side handler.
#[derive(Debug, Clone)]
pub struct ServerIdentity {
    pub version: String,
    pub server_id: String,
}

/// Delays and timeouts driving the reconnect state machine.
///
/// The defaults match the observed behavior of the link: fixed delays, no
/// backoff, no retry cap. Kept injectable so tests can run the same state
/// machine at millisecond scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause after a failed attempt to construct a client channel.
    pub dial_retry: Duration,
    /// Pause after any stream-level failure before the next dial.
    pub reconnect_delay: Duration,
    /// Interval between heartbeats on a healthy link.
    pub ping_interval: Duration,
    /// Per-call deadline in unary mode.
    pub unary_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            dial_retry: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(2),
            ping_interval: Duration::from_secs(5),
            unary_timeout: Duration::from_secs(5),
        }
    }
}

/// Which call shape the agent uses for its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// One persistent full-duplex stream per connection.
    Stream,
    /// One bounded unary call per interval.
    Unary,
}

/// Agent process configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub identity: AgentIdentity,
    /// Dial target, `host:port`.
    pub server_address: String,
    /// Encrypt the link without validating the server certificate.
    pub use_tls: bool,
    pub mode: CallMode,
    pub retry: RetryPolicy,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let identity = AgentIdentity {
            id: lookup("AGENT_ID").unwrap_or_else(|| Uuid::new_v4().to_string()),
            version: lookup("AGENT_VERSION").unwrap_or_else(|| "v1".to_string()),
        };
        let mode = match lookup("PING_MODE").as_deref() {
            Some("unary") => CallMode::Unary,
            _ => CallMode::Stream,
        };
        Self {
            identity,
            server_address: lookup("SERVER_ADDRESS")
                .unwrap_or_else(|| "localhost:50051".to_string()),
            use_tls: lookup("USE_TLS").as_deref() == Some("true"),
            mode,
            retry: RetryPolicy::default(),
        }
    }
}

/// Server process configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub identity: ServerIdentity,
    /// Listen port; an unparseable value surfaces as a bind failure.
    pub port: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            identity: ServerIdentity {
                version: lookup("SERVER_VERSION").unwrap_or_else(|| "unknown".to_string()),
                server_id: lookup("HOSTNAME").unwrap_or_else(|| "unknown".to_string()),
            },
            port: lookup("PORT").unwrap_or_else(|| "50051".to_string()),
        }
    }
}
