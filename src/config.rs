//! Server configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default request body limit, 50 MiB
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Default failure log file
pub const DEFAULT_FAILURE_LOG: &str = "mirador-failures.log";

/// Listener and transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// Port to bind, `0` lets the OS pick a free one
    pub port: u16,
    /// Append-only failure record file
    pub failure_log: PathBuf,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Allow cross-origin requests from any origin
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            failure_log: PathBuf::from(DEFAULT_FAILURE_LOG),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors: true,
        }
    }
}

impl ServerConfig {
    /// Set the port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the failure log path
    #[must_use]
    pub fn with_failure_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.failure_log = path.into();
        self
    }

    /// `host:port` as passed to the listener
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
