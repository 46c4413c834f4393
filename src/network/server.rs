use crate::messages::types::ProtocolVersion;
use crate::network::handler::ProtocolHandler;
use crate::network::manager::ConnectionManager;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};

/// Builds the protocol handler for one accepted peer
pub type HandlerFactory = Arc<dyn Fn(SocketAddr) -> Arc<dyn ProtocolHandler> + Send + Sync>;

const MAX_CONNECTIONS: usize = 1000;

/// Accepts peers and runs a single-socket [`ConnectionManager`] for each
pub struct Server {
    listener: TcpListener,
    factory: HandlerFactory,
    protocol_version: ProtocolVersion,
}

impl Server {
    pub async fn bind(addr: &str, factory: HandlerFactory) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind server to address: {}", addr))?;

        info!("Server successfully bound to address: {}", addr);

        Ok(Self {
            listener,
            factory,
            protocol_version: ProtocolVersion::CURRENT,
        })
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read server listen address")
    }

    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves, then close every live manager
    #[instrument(skip_all, fields(addr = ?self.listener.local_addr().ok()))]
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting server");

        let mut active_connections: HashMap<usize, ConnectionManager> = HashMap::new();
        let mut connection_counter = 0usize;
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    connection_counter += 1;
                    let connection_id = connection_counter;

                    active_connections.retain(|id, manager| {
                        if manager.is_closed() {
                            debug!("Cleaning up completed connection {}", id);
                            false
                        } else {
                            true
                        }
                    });

                    if active_connections.len() >= MAX_CONNECTIONS {
                        warn!(
                            "Connection limit reached ({}), rejecting connection from {}",
                            MAX_CONNECTIONS, peer_addr
                        );
                        continue;
                    }

                    info!("Accepted new connection {} from {}", connection_id, peer_addr);
                    let handler = (self.factory)(peer_addr);
                    let manager = ConnectionManager::from_socket(stream, self.protocol_version, handler);
                    manager.start();
                    active_connections.insert(connection_id, manager);
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            }
        }

        info!(active = active_connections.len(), "Server shutting down");
        for (id, manager) in active_connections {
            debug!("Closing connection {}", id);
            manager.close().await;
        }
        Ok(())
    }
}
