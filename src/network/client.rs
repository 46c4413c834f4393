use crate::network::connection::ConnectionError;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

/// Where the manager connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "tls" } else { "tcp" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// How each connection attempt obtains its socket
pub(crate) enum SocketSource {
    Connect(Endpoint),
    /// Single-socket mode: one already-connected socket, usable exactly once
    Provided(Mutex<Option<TcpStream>>),
}

impl SocketSource {
    pub(crate) fn provided(stream: TcpStream) -> Self {
        SocketSource::Provided(Mutex::new(Some(stream)))
    }

    #[instrument(level = "debug", skip(self), fields(source = %self))]
    pub(crate) async fn open(&self, connect_timeout: Duration) -> Result<TcpStream, ConnectionError> {
        match self {
            SocketSource::Connect(endpoint) => {
                debug!("Connecting to {}", endpoint);
                let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
                let stream = match tokio::time::timeout(connect_timeout, connect).await {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(timeout = ?connect_timeout, "Connect to {} timed out", endpoint);
                        return Err(ConnectionError::ConnectTimeout {
                            endpoint: endpoint.to_string(),
                            timeout: connect_timeout,
                        });
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to disable Nagle's algorithm");
                }
                info!("Connected to {}", endpoint);
                Ok(stream)
            }
            SocketSource::Provided(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or(ConnectionError::SocketConsumed),
        }
    }
}

impl fmt::Display for SocketSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSource::Connect(endpoint) => endpoint.fmt(f),
            SocketSource::Provided(_) => f.write_str("provided socket"),
        }
    }
}
