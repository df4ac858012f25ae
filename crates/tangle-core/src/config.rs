//! Runtime configuration for the mesh network core
//!
//! Values are read through opaque key lookup in the process environment
//! (`TANGLE_NET_*`), falling back to defaults. Nothing here touches disk.

use std::time::Duration;

use tracing::warn;

/// Configuration for timeouts, concurrency limits, and transport toggles
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// How long a routed request waits for its reply
    pub message_timeout: Duration,
    /// How long an outbound dial may take before the transport gives up
    pub connect_timeout: Duration,
    /// Maximum number of concurrent outgoing connection attempts
    pub outgoing_concurrency: usize,
    /// Whether TLS is requested from the transport collaborator
    pub tls: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_millis(1000),
            connect_timeout: Duration::from_secs(5),
            outgoing_concurrency: 4,
            tls: true,
        }
    }
}

impl NetConfig {
    /// Build a configuration from the environment, falling back to defaults
    /// for keys that are absent or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            message_timeout: lookup_ms("TANGLE_NET_MESSAGE_TIMEOUT")
                .unwrap_or(defaults.message_timeout),
            connect_timeout: lookup_ms("TANGLE_NET_CONNECT_TIMEOUT")
                .unwrap_or(defaults.connect_timeout),
            outgoing_concurrency: lookup("TANGLE_NET_MAX_OUTGOING")
                .unwrap_or(defaults.outgoing_concurrency),
            tls: lookup("TANGLE_NET_TLS").unwrap_or(defaults.tls),
        }
    }
}

fn lookup<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, raw, "Ignoring unparseable config value");
            None
        }
    }
}

fn lookup_ms(key: &str) -> Option<Duration> {
    lookup::<u64>(key).map(Duration::from_millis)
}
