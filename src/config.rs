use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for option {key}")]
    InvalidValue { key: String, value: String },
}

/// Engine binding and dispatch settings. Everything here is fixed before `start()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Either a bare port (`"8080"`) or a full `host:port`.
    pub listening_port: String,

    /// Root directory for the engine's static-file fallback.
    pub document_root: PathBuf,

    /// PEM certificate path. The bundled engine refuses to bind when this is set.
    pub ssl_certificate: Option<PathBuf>,

    /// Upper bound on a single poll tick.
    pub poll_interval_ms: u64,

    pub session_cookie: String,

    /// Sessions idle longer than this are dropped by the poll thread.
    pub session_ttl_secs: u64,

    /// Largest reassembled WebSocket message. Sockets exceeding it are closed with 1009.
    pub max_message_bytes: usize,

    /// Extra `key = value` options, applied on top of the fields above at `start()`.
    pub options: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listening_port: "80".to_string(),
            document_root: PathBuf::from("www"),
            ssl_certificate: None,
            poll_interval_ms: 1000,
            session_cookie: "sessid".to_string(),
            session_ttl_secs: 3600,
            max_message_bytes: crate::frame::MAX_FRAME_PAYLOAD,
            options: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn new(port: impl Into<String>, document_root: impl Into<PathBuf>) -> Self {
        Self {
            listening_port: port.into(),
            document_root: document_root.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Resolve the listening port into a socket address. A bare port binds every interface.
    pub fn bind_addr(&self) -> Result<SocketAddr, Error> {
        let port = self.listening_port.trim();
        if let Ok(number) = port.parse::<u16>() {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), number));
        }
        port.parse::<SocketAddr>()
            .map_err(|_| Error::InvalidPort(self.listening_port.clone()))
    }

    /// Set one named option. Fails for keys the server does not know about.
    pub fn apply_option(&mut self, key: &str, value: &str) -> Result<(), Error> {
        let invalid = || {
            Error::Config(ConfigError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })
        };
        match key {
            "listening_port" => self.listening_port = value.to_string(),
            "document_root" => self.document_root = PathBuf::from(value),
            "ssl_certificate" => self.ssl_certificate = Some(PathBuf::from(value)),
            "poll_interval_ms" => self.poll_interval_ms = value.parse().map_err(|_| invalid())?,
            "session_cookie" => {
                if value.is_empty() {
                    return Err(invalid());
                }
                self.session_cookie = value.to_string();
            }
            "session_ttl_secs" => self.session_ttl_secs = value.parse().map_err(|_| invalid())?,
            "max_message_bytes" => match value.parse() {
                Ok(limit) if limit > 0 => self.max_message_bytes = limit,
                _ => return Err(invalid()),
            },
            _ => {
                return Err(Error::UnknownOption {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// Fold the free-form `options` table into the typed fields.
    pub(crate) fn resolve(&self) -> Result<ServerConfig, Error> {
        let mut resolved = self.clone();
        for (key, value) in &self.options {
            resolved.apply_option(key, value)?;
        }
        resolved.options.clear();
        Ok(resolved)
    }
}
