//! Connection configuration shared by the pool and dedicated connections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default connect timeout; the store is expected on a near network.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Configuration for one store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Host name or IP address of the store.
    pub host: String,
    /// TCP port of the store.
    pub port: u16,
    /// Credential sent with AUTH. Empty means "no password".
    pub password: String,
    /// Logical database selected after every connect.
    pub database: u32,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Optional read/write timeout for request/reply exchanges.
    ///
    /// Never applied to subscription connections, which block until the next
    /// published message.
    pub command_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: String::new(),
            database: 0,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            command_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    /// Creates a config for `host:port` with the given credential.
    pub fn new(host: impl Into<String>, port: u16, password: impl Into<String>) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            password: password.into(),
            ..ClientConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_target_local_store() {
        let config = ClientConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 6379);
        assert!(config.password.is_empty());
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"host":"cache.local","database":2}"#).unwrap();
        assert_eq!(config.host, "cache.local");
        assert_eq!(config.port, 6379);
        assert_eq!(config.database, 2);
        assert_eq!(config.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn zero_connect_timeout_is_clamped() {
        let config = ClientConfig {
            connect_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.connect_timeout(), Duration::from_millis(1));
    }
}
