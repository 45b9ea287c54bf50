//! Error types for the proxy-core glue

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result alias for operations that can fail with [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The proxy core did not answer its control plane before the deadline
    #[error("proxy core on control port {control_port} not ready within {timeout:?}")]
    Startup { control_port: u16, timeout: Duration },

    #[error("failed to launch proxy core {}: {source}", path.display())]
    Launch {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("control plane {operation} failed: {message}")]
    ControlPlane {
        operation: &'static str,
        message: String,
    },

    #[error("no proxy core executable named `{prefix}*` found in {}", dir.display())]
    ExecutableNotFound { dir: PathBuf, prefix: String },

    #[error(
        "found {} proxy core candidates in {}; keep only the one for this platform",
        candidates.len(),
        dir.display()
    )]
    AmbiguousExecutable {
        dir: PathBuf,
        candidates: Vec<PathBuf>,
    },

    #[error("{} is not a valid executable: {reason}", path.display())]
    InvalidExecutable { path: PathBuf, reason: String },

    #[error("failed to read node list {}: {source}", path.display())]
    ProfileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse node list {}: {source}", path.display())]
    ProfileParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to write instance profile: {0}")]
    ProfileWrite(String),

    #[error("profile catalog: {0}")]
    Catalog(String),

    #[error("failed to allocate a local port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("instance pool is shut down")]
    PoolClosed,
}

impl Error {
    pub(crate) fn control(operation: &'static str, err: impl std::fmt::Display) -> Self {
        Error::ControlPlane {
            operation,
            message: err.to_string(),
        }
    }
}
