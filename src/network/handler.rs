use crate::messages::catalog::Catalog;
use crate::network::backoff::RetryDecision;
use crate::network::connection::{Connection, ConnectionError};
use async_trait::async_trait;
use std::time::Duration;

/// Application protocol that runs on top of a managed connection.
///
/// The manager calls `connect` once per attempt after the socket is open,
/// announces `Connected` when it succeeds, then hands the connection to
/// `transfer_data` until the session ends. Returning an error from either
/// hook ends the attempt; whether the manager reconnects is decided by its
/// configuration and by [`ProtocolHandler::retry_decision`].
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Protocol handshake. Failure is treated like a dropped connection.
    async fn connect(&self, connection: &mut Connection) -> Result<(), ConnectionError>;

    /// Main read/dispatch loop. `Ok(())` means the session ended normally.
    async fn transfer_data(&self, connection: &mut Connection) -> Result<(), ConnectionError>;

    /// Adjust which message kinds this protocol accepts
    fn message_kinds(&self, _catalog: &mut Catalog) {}

    /// Called after every failed attempt with the failure count and the
    /// delay the backoff schedule proposes.
    async fn retry_decision(&self, _consecutive_failures: u32, proposed: Duration) -> RetryDecision {
        RetryDecision::Retry(proposed)
    }
}
