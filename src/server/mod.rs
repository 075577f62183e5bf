use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 4444;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<config::ServerConfig> for ServerConfig {
    fn from(value: config::ServerConfig) -> Self {
        Self {
            host: value.host,
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// A freshly accepted producer connection, in blocking mode.
#[derive(Debug)]
pub struct AcceptedConnection {
    pub id: u64,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        let cfg = ServerConfig::from(app_config.server.clone());
        Self::bind(&cfg)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls the listener once. Connection ids are strictly increasing and
    /// start at 1; an id is only consumed by a successful accept.
    pub fn try_accept(&self) -> Result<Option<AcceptedConnection>, ServerError> {
        match self.listener.accept() {
            Ok((stream, peer_addr)) => {
                // Some platforms hand out accepted sockets inheriting the
                // listener's non-blocking flag.
                stream
                    .set_nonblocking(false)
                    .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
                let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                Ok(Some(AcceptedConnection {
                    id,
                    stream,
                    peer_addr,
                }))
            }
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(ServerError::Accept { source }),
        }
    }
}
