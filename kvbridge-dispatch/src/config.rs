//! Dispatcher configuration, loadable from JSON.

use std::fs;
use std::path::Path;
use std::time::Duration;

use kvbridge_client::ClientConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::slot::DEFAULT_RESULT_BATCH;

/// Default cap on concurrently running worker threads.
pub const DEFAULT_MAX_WORKERS: usize = 16;
/// Default time teardown waits for in-flight work.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Endpoint used by pooled, dedicated and subscription connections.
    pub client: ClientConfig,
    /// Slots allocated per growth step of each result pool.
    pub result_batch: usize,
    /// Upper bound on worker threads running commands at once.
    pub max_workers: usize,
    /// When true, a call whose connection could not be established still
    /// fires its callback with `success = false` on the next drain. When
    /// false the call is dropped without a callback.
    pub notify_preflight_failure: bool,
    /// How long teardown waits for in-flight work before giving up.
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            client: ClientConfig::default(),
            result_batch: DEFAULT_RESULT_BATCH,
            max_workers: DEFAULT_MAX_WORKERS,
            notify_preflight_failure: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn new(client: ClientConfig) -> Self {
        DispatcherConfig {
            client,
            ..DispatcherConfig::default()
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub(crate) fn worker_limit(&self) -> usize {
        self.max_workers.max(1)
    }
}
