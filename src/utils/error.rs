use std::{net::SocketAddr, path::PathBuf};

use thiserror::Error;

/// Startup faults. Runtime faults (client I/O, missing channel metadata) are
/// absorbed and logged where they happen instead of surfacing here.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("missing device: {0}")]
    DeviceMissing(PathBuf),

    #[error("invalid listen address: {0}")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
