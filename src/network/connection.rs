//! Per-attempt connection resources.
//!
//! A [`Connection`] is built fresh for every connection attempt and dropped
//! when the attempt ends; nothing in it survives a reconnect. The protocol
//! handler drives it: reads happen here, writes go through the shared writer
//! slot so that callers on other tasks can send concurrently.

use crate::messages::catalog::Catalog;
use crate::messages::demux::{DemuxStats, Demultiplexer, PacketFrame};
use crate::messages::types::{Message, Payload, ProtocolVersion, ValidationError};
use crate::messages::wire::{self, WireProtocolError};
use crate::network::manager::{ConnectionManager, Inner};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, instrument, trace};

/// Socket reads are always issued in chunks of this size
pub const READ_CHUNK_SIZE: usize = 10_240;

/// Upper bound on flushing and shutting down a writer that is being dropped
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Wire protocol error: {0}")]
    WireProtocol(#[from] WireProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connection to {endpoint} timed out after {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Write timed out after {timeout:?}")]
    WriteTimeout { timeout: Duration },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("The provided socket has already been used")]
    SocketConsumed,

    #[error("Connection manager is closed")]
    Closed,
}

impl ConnectionError {
    /// Failures that reconnecting cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectionError::Tls(_) | ConnectionError::Validation(_))
    }
}

pub(crate) trait LinkStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> LinkStream for T {}

pub(crate) type BoxedStream = Box<dyn LinkStream>;

/// Corruption counters that outlive individual connections
#[derive(Debug, Default)]
pub(crate) struct LinkCounters {
    pub(crate) corrupted_messages: AtomicU64,
    pub(crate) has_corrupt_data: AtomicBool,
}

/// The write side of the current connection, shared by every sender.
///
/// The slot is emptied when a connection ends and refilled with a fresh
/// writer by the next attempt. Closing the manager aborts every pending
/// write, so the lock is released as soon as the close signal fires.
pub(crate) struct SharedWriter {
    slot: Mutex<Option<WriteHalf<BoxedStream>>>,
    write_timeout: Duration,
    closed: watch::Receiver<bool>,
}

impl SharedWriter {
    pub(crate) fn new(write_timeout: Duration, closed: watch::Receiver<bool>) -> Self {
        Self {
            slot: Mutex::new(None),
            write_timeout,
            closed,
        }
    }

    async fn install(&self, writer: WriteHalf<BoxedStream>) {
        *self.slot.lock().await = Some(writer);
    }

    /// Remove the current writer and shut it down
    pub(crate) async fn shutdown(&self) {
        let taken = self.slot.lock().await.take();
        if let Some(mut writer) = taken {
            match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Error shutting down connection writer"),
                Err(_) => debug!("Writer shutdown timed out, dropping it"),
            }
        }
    }

    /// Write one or more complete frames while holding the connection-wide lock
    #[instrument(level = "trace", skip(self, data), fields(data_size = data.len()))]
    pub(crate) async fn write_frames(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => {
                debug!("Write abandoned, connection manager is closing");
                Err(ConnectionError::Closed)
            }
            result = self.write_locked(data) => result,
        }
    }

    async fn write_locked(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut slot = self.slot.lock().await;
        let writer = slot.as_mut().ok_or(ConnectionError::NotConnected)?;

        match tokio::time::timeout(self.write_timeout, write_all_with_recovery(writer, data)).await
        {
            Ok(result) => result,
            Err(_) => {
                error!(timeout = ?self.write_timeout, "Write operation timed out");
                Err(ConnectionError::WriteTimeout {
                    timeout: self.write_timeout,
                })
            }
        }
    }
}

/// Write every byte, treating a zero-length write as a closed writer
async fn write_all_with_recovery(
    writer: &mut (impl AsyncWrite + Unpin),
    data: &[u8],
) -> Result<(), ConnectionError> {
    let mut total_written = 0;

    while total_written < data.len() {
        match writer.write(&data[total_written..]).await {
            Ok(0) => {
                error!(
                    total_written,
                    remaining = data.len() - total_written,
                    "Write returned 0 bytes, writer is closed"
                );
                return Err(ConnectionError::ConnectionClosed);
            }
            Ok(written) => {
                total_written += written;
                trace!(written, total_written, "Partial write completed");
            }
            Err(e) => {
                error!(error = %e, total_written, data_size = data.len(), "Write operation failed");
                return Err(e.into());
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

/// Resolves once the manager has been closed (or dropped)
pub(crate) async fn closed_signal(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// One live connection: the read side, its demultiplexer, and access to the
/// shared writer.
pub struct Connection {
    reader: ReadHalf<BoxedStream>,
    demux: Demultiplexer,
    writer: Arc<SharedWriter>,
    closed: watch::Receiver<bool>,
    chunk: Vec<u8>,
    counters: Arc<LinkCounters>,
    reported_corrupt: u64,
    version: ProtocolVersion,
    peer_addr: Option<SocketAddr>,
    manager: Weak<Inner>,
}

impl Connection {
    pub(crate) async fn establish(
        stream: BoxedStream,
        catalog: Catalog,
        writer: Arc<SharedWriter>,
        closed: watch::Receiver<bool>,
        counters: Arc<LinkCounters>,
        peer_addr: Option<SocketAddr>,
        manager: Weak<Inner>,
    ) -> Self {
        let (reader, write_half) = tokio::io::split(stream);
        writer.install(write_half).await;
        let version = catalog.version();
        debug!(?peer_addr, %version, "Connection resources created");

        Self {
            reader,
            demux: Demultiplexer::new(catalog),
            writer,
            closed,
            chunk: vec![0u8; READ_CHUNK_SIZE],
            counters,
            reported_corrupt: 0,
            version,
            peer_addr,
            manager,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn catalog(&self) -> &Catalog {
        self.demux.catalog()
    }

    pub fn stats(&self) -> DemuxStats {
        self.demux.stats()
    }

    /// Handle to the owning manager, e.g. to close it from inside the handler
    pub fn manager(&self) -> Option<ConnectionManager> {
        self.manager.upgrade().map(ConnectionManager::from_inner)
    }

    /// Build a message at this connection's protocol version
    pub fn message(&self, payload: impl Into<Payload>) -> Message {
        Message::with_version(self.version, payload)
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), ConnectionError> {
        let bytes = wire::encode(message)?;
        trace!(kind = %message.kind(), length = bytes.len(), "Sending message");
        self.writer.write_frames(&bytes).await
    }

    /// Encode `payload` at the connection's version and send it
    pub async fn send(&self, payload: impl Into<Payload>) -> Result<(), ConnectionError> {
        let message = self.message(payload);
        self.send_message(&message).await
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        let mut bytes = Vec::new();
        wire::encode_packet(packet, &mut bytes)?;
        self.writer.write_frames(&bytes).await
    }

    pub async fn end_packet_stream(&self) -> Result<(), ConnectionError> {
        let mut bytes = Vec::new();
        wire::encode_packet_stream_end(&mut bytes);
        self.writer.write_frames(&bytes).await
    }

    /// Read until a complete message is available.
    ///
    /// Returns `Ok(None)` when the peer shuts the stream down cleanly.
    #[instrument(level = "trace", skip(self))]
    pub async fn read_next_message(&mut self) -> Result<Option<Message>, ConnectionError> {
        loop {
            let next = self.demux.read_next();
            self.report_corruption();
            if let Some(message) = next? {
                return Ok(Some(message));
            }
            if self.fill().await? == 0 {
                self.log_eof();
                return Ok(None);
            }
        }
    }

    /// Read until a complete bulk packet (or the end-of-stream marker) is available.
    ///
    /// Returns `Ok(None)` when the peer shuts the stream down cleanly.
    #[instrument(level = "trace", skip(self))]
    pub async fn read_next_packet(&mut self) -> Result<Option<PacketFrame>, ConnectionError> {
        loop {
            if let Some(frame) = self.demux.read_next_packet()? {
                return Ok(Some(frame));
            }
            if self.fill().await? == 0 {
                self.log_eof();
                return Ok(None);
            }
        }
    }

    /// One socket read into the demultiplexer; 0 means orderly shutdown by the peer
    async fn fill(&mut self) -> Result<usize, ConnectionError> {
        let read = tokio::select! {
            biased;
            _ = closed_signal(&mut self.closed) => return Err(ConnectionError::Closed),
            result = self.reader.read(&mut self.chunk) => result?,
        };
        if read > 0 {
            trace!(read, required = self.demux.bytes_required(), "Socket read");
            self.demux.append(&self.chunk[..read]);
        }
        Ok(read)
    }

    fn report_corruption(&mut self) {
        let corrupted = self.demux.stats().corrupted_messages;
        if corrupted > self.reported_corrupt {
            self.counters
                .corrupted_messages
                .fetch_add(corrupted - self.reported_corrupt, Ordering::Relaxed);
            self.counters.has_corrupt_data.store(true, Ordering::Relaxed);
            self.reported_corrupt = corrupted;
        }
    }

    fn log_eof(&self) {
        let partial = self.demux.buffered();
        if partial > 0 {
            debug!(partial, "Peer closed the stream with a partial frame buffered");
        } else {
            debug!("Peer closed the stream");
        }
    }
}
