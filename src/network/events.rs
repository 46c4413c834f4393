//! Connection state tracking and event publication.
//!
//! [`Lifecycle`] decides which transitions are real (and therefore announced);
//! [`EventBus`] delivers the resulting events to broadcast subscribers and to
//! registered listeners. Listener panics are contained in the dispatch loop.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal: no further transitions happen
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Closed,
    Failed(String),
}

/// State machine behind the public connection state.
///
/// Every method returns the events the transition should announce; a
/// transition that does not change anything announces nothing.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    failed: bool,
    disconnect_announced: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failed: false,
            disconnect_announced: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Returns false once closed; the attempt must not go ahead
    pub fn begin_connecting(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn connected(&mut self) -> Option<ConnectionEvent> {
        if self.is_closed() || self.state == ConnectionState::Connected {
            return None;
        }
        self.state = ConnectionState::Connected;
        self.disconnect_announced = false;
        Some(ConnectionEvent::Connected)
    }

    pub fn disconnected(&mut self) -> Option<ConnectionEvent> {
        if self.is_closed() {
            return None;
        }
        self.state = ConnectionState::Disconnected;
        if self.disconnect_announced {
            return None;
        }
        self.disconnect_announced = true;
        Some(ConnectionEvent::Disconnected)
    }

    /// Set the failed flag; independent of the connected/disconnected axis
    pub fn failed(&mut self, reason: impl Into<String>) -> Option<ConnectionEvent> {
        if self.is_closed() || self.failed {
            return None;
        }
        self.failed = true;
        Some(ConnectionEvent::Failed(reason.into()))
    }

    /// Enter the terminal state, announcing a disconnect first if one is owed
    pub fn close(&mut self) -> Vec<ConnectionEvent> {
        if self.is_closed() {
            return Vec::new();
        }
        let mut events = Vec::with_capacity(2);
        if !self.disconnect_announced {
            self.disconnect_announced = true;
            events.push(ConnectionEvent::Disconnected);
        }
        self.state = ConnectionState::Closed;
        events.push(ConnectionEvent::Closed);
        events
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

pub type EventListener = Arc<dyn Fn(&ConnectionEvent) + Send + Sync>;

/// Publish/subscribe hub for connection events.
///
/// `publish` never blocks, so it may be called while holding the lifecycle
/// lock; that keeps event order identical to transition order. Broadcast
/// subscribers see events immediately, listeners run on a dispatch task.
pub struct EventBus {
    broadcast: broadcast::Sender<ConnectionEvent>,
    dispatch: mpsc::UnboundedSender<ConnectionEvent>,
    listeners: Arc<Mutex<Vec<EventListener>>>,
}

impl EventBus {
    /// Must be called from within a Tokio runtime
    pub fn new() -> Self {
        let (broadcast, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (dispatch, queue) = mpsc::unbounded_channel();
        let listeners: Arc<Mutex<Vec<EventListener>>> = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(dispatch_loop(queue, Arc::clone(&listeners)));
        Self {
            broadcast,
            dispatch,
            listeners,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.broadcast.subscribe()
    }

    pub fn add_listener(&self, listener: EventListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn publish(&self, event: ConnectionEvent) {
        debug!(?event, "Publishing connection event");
        // No subscribers is not an error
        let _ = self.broadcast.send(event.clone());
        let _ = self.dispatch.send(event);
    }
}

async fn dispatch_loop(
    mut queue: mpsc::UnboundedReceiver<ConnectionEvent>,
    listeners: Arc<Mutex<Vec<EventListener>>>,
) {
    while let Some(event) = queue.recv().await {
        let snapshot = listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(?event, "Connection event listener panicked");
            }
        }
    }
}
