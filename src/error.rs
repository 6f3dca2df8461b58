use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no target to balance on")]
    EmptyTargets,

    #[error("unknown load balancing mode: {0:?}")]
    UnknownMode(String),

    #[error("invalid target {0:?}, expected host:port")]
    InvalidTarget(String),

    #[error("failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("error listening on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("error accepting connection")]
    Accept(#[source] io::Error),

    #[error("accept worker failed")]
    Worker(#[source] tokio::task::JoinError),
}
