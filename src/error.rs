use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors surfaced by the server lifecycle and its engine binding.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server has been stopped and cannot be restarted")]
    Stopped,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid listening port {0:?}")]
    InvalidPort(String),

    #[error("failed to set {key}: unknown option")]
    UnknownOption { key: String },

    #[error("TLS termination is not available in this engine (certificate {0})")]
    TlsUnsupported(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Error::Bind {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
