//! TLS client wrapping for connections that require it.

use crate::network::connection::ConnectionError;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info};

/// Client configuration trusting the bundled webpki roots
pub fn default_client_config() -> Result<Arc<ClientConfig>, ConnectionError> {
    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    debug!("Loaded {} webpki root certificates", root_store.len());

    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ConnectionError::Tls(format!("Unsupported TLS protocol configuration: {e}")))?
    .with_root_certificates(root_store)
    .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Run the TLS client handshake over an open TCP stream
pub async fn wrap(
    stream: TcpStream,
    server_name: &str,
    config: Arc<ClientConfig>,
) -> Result<TlsStream<TcpStream>, ConnectionError> {
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| ConnectionError::Tls(format!("Invalid server name '{server_name}': {e}")))?;

    let tls_stream = TlsConnector::from(config)
        .connect(name, stream)
        .await
        .map_err(|e| {
            error!(server_name, error = %e, "TLS handshake failed");
            ConnectionError::Tls(format!("TLS handshake with {server_name} failed: {e}"))
        })?;

    info!(server_name, "TLS session established");
    Ok(tls_stream)
}
