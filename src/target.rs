use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    ops::Index,
    str::FromStr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use crate::error::ConfigError;

/// Counters are shared by every session relaying through this target and may
/// be read slightly stale.
#[derive(Debug)]
pub struct Target {
    host: String,
    port: u16,
    active_conn: AtomicI64,
    errors: AtomicI64,
    total_handled: AtomicI64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub host: String,
    pub port: u16,
    pub active_conn: i64,
    pub errors: i64,
    pub total_handled: i64,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        debug!("Creating new target: {}:{}", host, port);
        Self {
            host,
            port,
            active_conn: AtomicI64::new(0),
            errors: AtomicI64::new(0),
            total_handled: AtomicI64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn active_conn(&self) -> i64 {
        self.active_conn.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> i64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn total_handled(&self) -> i64 {
        self.total_handled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn track_session(self: &Arc<Self>) -> ActiveConnGuard {
        self.active_conn.fetch_add(1, Ordering::Relaxed);
        self.total_handled.fetch_add(1, Ordering::Relaxed);
        ActiveConnGuard {
            target: Arc::clone(self),
        }
    }

    pub fn status(&self) -> TargetStatus {
        TargetStatus {
            host: self.host.clone(),
            port: self.port,
            active_conn: self.active_conn(),
            errors: self.errors(),
            total_handled: self.total_handled(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl From<&TargetConfig> for Target {
    fn from(config: &TargetConfig) -> Self {
        Target::new(config.host.clone(), config.port)
    }
}

impl FromStr for TargetConfig {
    type Err = ConfigError;

    /// Parses `host:port`. IPv6 hosts must be bracketed: `[::1]:8080`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidTarget(s.to_string());
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse().map_err(|_| invalid())?;
        Ok(TargetConfig {
            host: host.to_string(),
            port,
        })
    }
}

/// Decrements the target's active connection count exactly once, when dropped.
#[derive(Debug)]
pub(crate) struct ActiveConnGuard {
    target: Arc<Target>,
}

impl Drop for ActiveConnGuard {
    fn drop(&mut self) {
        self.target.active_conn.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Insertion order is what round-robin and IP-hash index into.
#[derive(Debug, Clone)]
pub struct Targets(Arc<[Arc<Target>]>);

impl Targets {
    pub fn new(targets: Vec<Target>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        Ok(Self(targets.into_iter().map(Arc::new).collect()))
    }

    pub fn from_config(configs: &[TargetConfig]) -> Result<Self, ConfigError> {
        Self::new(configs.iter().map(Target::from).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<Target>> {
        self.0.iter()
    }

    pub fn snapshot(&self) -> Vec<TargetStatus> {
        self.0.iter().map(|t| t.status()).collect()
    }

    pub fn log_status(&self) {
        for (i, target) in self.0.iter().enumerate() {
            info!(
                "Target {}: {} | Active: {} | Errors: {} | Total: {}",
                i,
                target,
                target.active_conn(),
                target.errors(),
                target.total_handled()
            );
        }
    }
}

impl Index<usize> for Targets {
    type Output = Arc<Target>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.0[index]
    }
}
