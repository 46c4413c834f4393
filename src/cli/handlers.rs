//! Protocol handlers used by the `watch` and `listen` commands.

use crate::messages::catalog::Catalog;
use crate::messages::demux::PacketFrame;
use crate::messages::types::{
    now_micros, ClockDrift, LiveViewStart, Message, MessageKind, Payload, RegisterAnalyst,
};
use crate::network::connection::{Connection, ConnectionError};
use crate::network::handler::ProtocolHandler;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// What a live view produces for whoever is displaying it
#[derive(Debug, Clone, PartialEq)]
pub enum LiveUpdate {
    Message(Message),
    Packet(Vec<u8>),
    PacketStreamEnded,
    ClockDrift {
        round_trip: Duration,
        clock_skew_micros: Option<i64>,
    },
}

/// Reply to an unanswered drift probe; returns the measurement for answered ones
async fn handle_clock_drift(
    connection: &Connection,
    drift: &ClockDrift,
) -> Result<Option<LiveUpdate>, ConnectionError> {
    let received_at = now_micros();
    if drift.is_answered() {
        return Ok(Some(LiveUpdate::ClockDrift {
            round_trip: drift.round_trip(received_at),
            clock_skew_micros: drift.clock_skew(received_at),
        }));
    }
    connection.send(drift.clone().answered_at(received_at)).await?;
    Ok(None)
}

/// Analyst side of a live view.
///
/// Registers, asks for the configured session, then forwards everything the
/// peer streams back. The manager is closed once the session closes.
pub struct LiveViewHandler {
    request: LiveViewStart,
    user_name: String,
    updates: mpsc::UnboundedSender<LiveUpdate>,
}

impl LiveViewHandler {
    pub fn new(
        request: LiveViewStart,
        user_name: impl Into<String>,
        updates: mpsc::UnboundedSender<LiveUpdate>,
    ) -> Self {
        Self {
            request,
            user_name: user_name.into(),
            updates,
        }
    }

    fn forward(&self, update: LiveUpdate) {
        if self.updates.send(update).is_err() {
            debug!("Live view consumer has gone away");
        }
    }

    /// Forward packets until the end-of-stream marker; false if the peer hung up first
    async fn forward_packet_stream(&self, connection: &mut Connection) -> Result<bool, ConnectionError> {
        loop {
            match connection.read_next_packet().await? {
                Some(PacketFrame::Packet(packet)) => self.forward(LiveUpdate::Packet(packet)),
                Some(PacketFrame::EndOfStream) => {
                    self.forward(LiveUpdate::PacketStreamEnded);
                    return Ok(true);
                }
                None => return Ok(false),
            }
        }
    }
}

#[async_trait]
impl ProtocolHandler for LiveViewHandler {
    #[instrument(skip_all, fields(session = %self.request.session_id))]
    async fn connect(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        self.request.validate()?;

        connection
            .send(RegisterAnalyst {
                client_id: Uuid::new_v4(),
                user_name: self.user_name.clone(),
            })
            .await?;
        connection.send(self.request.clone()).await?;
        info!(channel = %self.request.channel_id, offset = self.request.sequence_offset, "Live view requested");
        Ok(())
    }

    #[instrument(skip_all, fields(session = %self.request.session_id))]
    async fn transfer_data(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        while let Some(message) = connection.read_next_message().await? {
            debug!(kind = %message.kind(), "Live view message");
            if let Payload::ClockDrift(drift) = message.payload() {
                if let Some(update) = handle_clock_drift(connection, drift).await? {
                    self.forward(update);
                }
                continue;
            }

            let starts_packets = matches!(message.payload(), Payload::PacketStreamStart(_));
            let closes_session = matches!(
                message.payload(),
                Payload::SessionClosed(closed) if closed.session_id == self.request.session_id
            );
            self.forward(LiveUpdate::Message(message));

            if starts_packets && !self.forward_packet_stream(connection).await? {
                return Ok(());
            }
            if closes_session {
                info!("Session closed by peer");
                if let Some(manager) = connection.manager() {
                    manager.close().await;
                }
                return Ok(());
            }
        }
        Ok(())
    }

    fn message_kinds(&self, catalog: &mut Catalog) {
        // Requests only ever travel towards the agent
        catalog
            .disable(MessageKind::RegisterAgent)
            .disable(MessageKind::GetSessionHeaders)
            .disable(MessageKind::LiveViewStart);
    }
}

/// Diagnostic peer that logs whatever it receives
pub struct LoggingHandler {
    peer: SocketAddr,
}

impl LoggingHandler {
    pub fn new(peer: SocketAddr) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl ProtocolHandler for LoggingHandler {
    async fn connect(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        info!(peer = %self.peer, version = %connection.protocol_version(), "Peer connected");
        Ok(())
    }

    #[instrument(skip_all, fields(peer = %self.peer))]
    async fn transfer_data(&self, connection: &mut Connection) -> Result<(), ConnectionError> {
        while let Some(message) = connection.read_next_message().await? {
            info!(kind = %message.kind(), version = %message.version(), "{:?}", message.payload());
            match message.payload() {
                Payload::ClockDrift(drift) => {
                    if let Some(LiveUpdate::ClockDrift { round_trip, clock_skew_micros }) =
                        handle_clock_drift(connection, drift).await?
                    {
                        info!(?round_trip, ?clock_skew_micros, "Clock drift measured");
                    }
                }
                Payload::PacketStreamStart(_) => loop {
                    match connection.read_next_packet().await? {
                        Some(PacketFrame::Packet(packet)) => {
                            info!(size = packet.len(), "Packet received");
                        }
                        Some(PacketFrame::EndOfStream) => {
                            info!("Packet stream ended");
                            break;
                        }
                        None => return Ok(()),
                    }
                },
                _ => {}
            }
        }

        let stats = connection.stats();
        if stats.corrupted_messages > 0 {
            warn!(corrupted = stats.corrupted_messages, "Peer sent corrupted messages");
        }
        info!(messages = stats.messages_decoded, packets = stats.packets_decoded, "Peer disconnected");
        Ok(())
    }
}
