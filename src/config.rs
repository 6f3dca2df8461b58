use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::{
    balancer::Mode,
    error::ConfigError,
    relay::RelayOptions,
    target::TargetConfig,
};

/// Read from JSON such as:
///
/// ```json
/// {
///   "listen_addr": "0.0.0.0:7000",
///   "mode": "round-robin",
///   "targets": [
///     { "host": "127.0.0.1", "port": 8001 },
///     { "host": "127.0.0.1", "port": 8002 }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// How often to log every target's counters. Off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_interval_secs: Option<u64>,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, targets: Vec<TargetConfig>, mode: Mode) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            targets,
            mode,
            connect_timeout_ms: None,
            idle_timeout_ms: None,
            status_interval_secs: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn status_interval(&self) -> Option<Duration> {
        self.status_interval_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}
