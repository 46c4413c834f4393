//! Connect, transfer, retry and close lifecycle for one logical connection.
//!
//! A [`ConnectionManager`] owns one background worker task. Each pass of the
//! worker loop is one connection attempt: open a socket, optionally wrap it
//! in TLS, run the protocol handler's handshake and transfer loop, then tear
//! everything down and decide whether to try again. [`ConnectionManager::close`]
//! is the only way to stop it.

use crate::messages::catalog::Catalog;
use crate::messages::types::{Message, ProtocolVersion};
use crate::messages::wire;
use crate::network::backoff::{Backoff, RetryDecision};
use crate::network::client::{Endpoint, SocketSource};
use crate::network::connection::{
    closed_signal, BoxedStream, Connection, ConnectionError, LinkCounters, SharedWriter,
};
use crate::network::events::{ConnectionEvent, ConnectionState, EventBus, Lifecycle};
use crate::network::handler::ProtocolHandler;
use crate::network::tls;
use rustls::ClientConfig;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// How long `close` waits for the worker before giving up on it
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    // Id of the manager whose worker is running the current task
    static WORKER_OF: u64;
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub endpoint: Endpoint,
    pub protocol_version: ProtocolVersion,
    pub auto_reconnect: bool,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Name checked against the server certificate; defaults to the host
    pub tls_server_name: Option<String>,
    /// Client TLS settings; the bundled webpki roots are used when unset
    pub tls_config: Option<Arc<ClientConfig>>,
}

impl ConnectionConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            protocol_version: ProtocolVersion::CURRENT,
            auto_reconnect: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            tls_server_name: None,
            tls_config: None,
        }
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_tls_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.tls_server_name = Some(server_name.into());
        self
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("protocol_version", &self.protocol_version)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("connect_timeout", &self.connect_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("tls_server_name", &self.tls_server_name)
            .field("tls_config", &self.tls_config.is_some())
            .finish()
    }
}

/// Cheaply cloneable handle to a managed connection
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    id: u64,
    config: ConnectionConfig,
    source: SocketSource,
    handler: Arc<dyn ProtocolHandler>,
    retry_enabled: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    events: EventBus,
    writer: Arc<SharedWriter>,
    closed_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    backoff: Mutex<Backoff>,
    counters: Arc<LinkCounters>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConnectionManager {
    /// Manager that connects (and reconnects) to `config.endpoint`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<H: ProtocolHandler>(config: ConnectionConfig, handler: H) -> Self {
        Self::with_handler(config, Arc::new(handler))
    }

    pub fn with_handler(config: ConnectionConfig, handler: Arc<dyn ProtocolHandler>) -> Self {
        let source = SocketSource::Connect(config.endpoint.clone());
        Self::build(config, source, handler)
    }

    /// Single-socket mode: wrap an already-connected socket and never reconnect
    pub fn from_socket(
        stream: TcpStream,
        protocol_version: ProtocolVersion,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Self {
        let endpoint = match stream.peer_addr() {
            Ok(addr) => Endpoint::new(addr.ip().to_string(), addr.port()),
            Err(_) => Endpoint::new("unknown", 0),
        };
        let config = ConnectionConfig::new(endpoint)
            .with_protocol_version(protocol_version)
            .with_auto_reconnect(false);
        Self::build(config, SocketSource::provided(stream), handler)
    }

    fn build(config: ConnectionConfig, source: SocketSource, handler: Arc<dyn ProtocolHandler>) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let inner = Inner {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            retry_enabled: AtomicBool::new(config.auto_reconnect),
            writer: Arc::new(SharedWriter::new(config.write_timeout, closed_rx)),
            config,
            source,
            handler,
            lifecycle: Mutex::new(Lifecycle::new()),
            events: EventBus::new(),
            closed_tx,
            worker: Mutex::new(None),
            backoff: Mutex::new(Backoff::new()),
            counters: Arc::new(LinkCounters::default()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Spawn the background worker unless it is already running
    pub fn start(&self) {
        let mut worker = lock(&self.inner.worker);
        if worker.is_some() {
            debug!(manager = self.inner.id, "Connection worker already running");
            return;
        }
        if self.inner.is_closed() {
            debug!(manager = self.inner.id, "Not starting a closed connection manager");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let span = tracing::info_span!("connection_worker", manager = inner.id, source = %inner.source);
        let task = WORKER_OF.scope(inner.id, run_worker(inner)).instrument(span);
        *worker = Some(tokio::spawn(task));
    }

    /// Enter the terminal `Closed` state and stop the worker.
    ///
    /// Safe to call repeatedly and from any task, including from inside the
    /// protocol handler.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), ConnectionError> {
        if self.inner.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let bytes = wire::encode(message)?;
        self.inner.writer.write_frames(&bytes).await
    }

    pub async fn send_packet(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        if self.inner.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut bytes = Vec::new();
        wire::encode_packet(packet, &mut bytes)?;
        self.inner.writer.write_frames(&bytes).await
    }

    pub async fn end_packet_stream(&self) -> Result<(), ConnectionError> {
        if self.inner.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let mut bytes = Vec::new();
        wire::encode_packet_stream_end(&mut bytes);
        self.inner.writer.write_frames(&bytes).await
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.lifecycle).state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn is_failed(&self) -> bool {
        lock(&self.inner.lifecycle).is_failed()
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock(&self.inner.backoff).consecutive_failures()
    }

    /// Messages dropped for corrupt bodies, across all connections so far
    pub fn corrupted_messages(&self) -> u64 {
        self.inner.counters.corrupted_messages.load(Ordering::Relaxed)
    }

    pub fn has_corrupt_data(&self) -> bool {
        self.inner.counters.has_corrupt_data.load(Ordering::Relaxed)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.inner.config.protocol_version
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    /// Receive every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Register a callback for connection events; panics inside it are logged and ignored
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.inner.events.add_listener(Arc::new(listener));
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source.to_string())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        lock(&self.lifecycle).is_closed()
    }

    /// Apply a lifecycle transition and publish its event under the same lock
    fn announce<F>(&self, transition: F)
    where
        F: FnOnce(&mut Lifecycle) -> Option<ConnectionEvent>,
    {
        let mut lifecycle = lock(&self.lifecycle);
        if let Some(event) = transition(&mut lifecycle) {
            self.events.publish(event);
        }
    }

    fn running_on_worker(&self) -> bool {
        WORKER_OF.try_with(|id| *id == self.id).unwrap_or(false)
    }

    async fn close(self: &Arc<Self>) {
        self.retry_enabled.store(false, Ordering::SeqCst);
        let closing = {
            let mut lifecycle = lock(&self.lifecycle);
            let events = lifecycle.close();
            let closing = !events.is_empty();
            for event in events {
                self.events.publish(event);
            }
            closing
        };
        if closing {
            info!(manager = self.id, source = %self.source, "Closing connection");
        }
        // Wakes a pending backoff sleep, any blocked read and any stalled write
        self.closed_tx.send_replace(true);
        self.writer.shutdown().await;

        let handle = lock(&self.worker).take();
        let Some(mut handle) = handle else {
            return;
        };
        if self.running_on_worker() {
            debug!(manager = self.id, "Close called from the worker; not waiting for it");
            return;
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => debug!(manager = self.id, "Connection worker stopped"),
            Ok(Err(e)) => error!(manager = self.id, error = %e, "Connection worker ended abnormally"),
            Err(_) => {
                warn!(
                    manager = self.id,
                    timeout = ?CLOSE_TIMEOUT,
                    "Connection worker did not stop in time, aborting it"
                );
                handle.abort();
            }
        }
    }

    async fn fail_and_close(self: &Arc<Self>, reason: String) {
        error!(manager = self.id, reason = %reason, "Connection failed permanently");
        self.announce(|lifecycle| lifecycle.failed(reason));
        self.close().await;
    }

    /// Sleep for `delay`; false when the sleep was cut short by `close`
    async fn sleep_unless_closed(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.is_closed();
        }
        let mut closed = self.closed_tx.subscribe();
        tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => false,
            _ = tokio::time::sleep(delay) => !self.is_closed(),
        }
    }

    /// One connection attempt, from socket to the end of the transfer loop
    #[instrument(level = "debug", skip(self), fields(manager = self.id))]
    async fn run_attempt(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if !lock(&self.lifecycle).begin_connecting() {
            return Err(ConnectionError::Closed);
        }
        let mut closed = self.closed_tx.subscribe();

        let tcp = tokio::select! {
            biased;
            _ = closed_signal(&mut closed) => return Err(ConnectionError::Closed),
            result = self.source.open(self.config.connect_timeout) => result?,
        };
        let peer_addr = tcp.peer_addr().ok();

        let stream: BoxedStream = if self.config.endpoint.use_tls {
            let tls_config = match &self.config.tls_config {
                Some(config) => Arc::clone(config),
                None => tls::default_client_config()?,
            };
            let server_name = self
                .config
                .tls_server_name
                .clone()
                .unwrap_or_else(|| self.config.endpoint.host.clone());
            let tls_stream = tokio::select! {
                biased;
                _ = closed_signal(&mut closed) => return Err(ConnectionError::Closed),
                result = tls::wrap(tcp, &server_name, tls_config) => result?,
            };
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let mut catalog = Catalog::for_version(self.config.protocol_version);
        self.handler.message_kinds(&mut catalog);

        let mut connection = Connection::establish(
            stream,
            catalog,
            Arc::clone(&self.writer),
            closed,
            Arc::clone(&self.counters),
            peer_addr,
            Arc::downgrade(self),
        )
        .await;

        self.handler.connect(&mut connection).await?;

        lock(&self.backoff).record_success();
        self.announce(|lifecycle| lifecycle.connected());
        info!(?peer_addr, version = %self.config.protocol_version, "Connection established");

        self.handler.transfer_data(&mut connection).await
    }
}

async fn run_worker(inner: Arc<Inner>) {
    debug!("Connection worker started");

    while !inner.is_closed() {
        let result = inner.run_attempt().await;
        // Per-attempt resources never outlive the attempt
        inner.writer.shutdown().await;

        if inner.is_closed() {
            break;
        }

        match &result {
            Ok(()) => info!("Connection ended"),
            Err(e) => warn!(error = %e, "Connection attempt failed"),
        }
        inner.announce(|lifecycle| lifecycle.disconnected());

        if let Err(e) = &result {
            if e.is_fatal() {
                inner.fail_and_close(e.to_string()).await;
                break;
            }
        }

        if !inner.retry_enabled.load(Ordering::SeqCst) {
            match result {
                Err(e) => inner.fail_and_close(e.to_string()).await,
                Ok(()) => inner.close().await,
            }
            break;
        }

        let (failures, proposed) = {
            let mut backoff = lock(&inner.backoff);
            let delay = backoff.record_failure();
            (backoff.consecutive_failures(), delay)
        };

        match inner.handler.retry_decision(failures, proposed).await {
            RetryDecision::Stop => {
                inner
                    .fail_and_close(format!("reconnect abandoned after {failures} consecutive failures"))
                    .await;
                break;
            }
            RetryDecision::Retry(delay) => {
                if !delay.is_zero() {
                    info!(failures, delay_ms = delay.as_millis() as u64, "Waiting before reconnecting");
                }
                if !inner.sleep_unless_closed(delay).await {
                    break;
                }
            }
        }
    }

    debug!("Connection worker exiting");
}
