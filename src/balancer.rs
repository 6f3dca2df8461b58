use log::{trace, warn};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    error::ConfigError,
    target::{Target, Targets},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Mode {
    #[default]
    LeastConn,
    RoundRobin,
    IpHash,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::LeastConn => "least-conn",
            Mode::RoundRobin => "round-robin",
            Mode::IpHash => "ip-hash",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "least-conn" => Ok(Mode::LeastConn),
            "round-robin" => Ok(Mode::RoundRobin),
            "ip-hash" => Ok(Mode::IpHash),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

/// The round-robin cursor starts at zero and is never shared between balancers.
#[derive(Debug)]
pub struct Balancer {
    targets: Targets,
    mode: Mode,
    cursor: AtomicU64,
}

impl Balancer {
    pub fn new(targets: Targets, mode: Mode) -> Self {
        if targets.len() == 1 {
            warn!("Only one target configured, {} mode has no effect", mode);
        }
        Self {
            targets,
            mode,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// `peer` only matters in [`Mode::IpHash`].
    pub fn select(&self, peer: IpAddr) -> &Arc<Target> {
        if self.targets.len() == 1 {
            return &self.targets[0];
        }

        let index = match self.mode {
            Mode::RoundRobin => self.round_robin(),
            Mode::LeastConn => self.least_conn(),
            Mode::IpHash => ip_hash(peer, self.targets.len()),
        };

        let target = &self.targets[index];
        trace!(
            "{} picked target {}: {} [active: {}, errors: {}]",
            self.mode,
            index,
            target,
            target.active_conn(),
            target.errors()
        );
        target
    }

    fn next_draw(&self) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    fn round_robin(&self) -> usize {
        (self.next_draw() % self.targets.len() as u64) as usize
    }

    /// Index of the first target with the fewest active connections. Counters
    /// keep moving while we scan, so this is a best-effort minimum.
    fn least_conn(&self) -> usize {
        self.targets
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.active_conn())
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

/// IPv4-mapped IPv6 addresses hash like the IPv4 address they carry.
pub fn ip_hash(ip: IpAddr, len: usize) -> usize {
    let total: u64 = match ip.to_canonical() {
        IpAddr::V4(v4) => v4.octets().iter().map(|&b| u64::from(b)).sum(),
        IpAddr::V6(v6) => v6.octets().iter().map(|&b| u64::from(b)).sum(),
    };
    (total % len as u64) as usize
}
