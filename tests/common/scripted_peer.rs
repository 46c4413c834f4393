//! The remote end of a test connection, driven step by step from the test body

use sessionlink::messages::types::Message;
use sessionlink::messages::wire;
use sessionlink::messages::{Catalog, Demultiplexer};
use sessionlink::network::client::Endpoint;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a loopback listener on a free port
pub async fn bind_local() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let port = listener.local_addr().expect("listener address").port();
    (listener, Endpoint::new("127.0.0.1", port))
}

pub async fn accept(listener: &TcpListener) -> ScriptedPeer {
    let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("Timed out waiting for the manager to connect")
        .expect("Failed to accept connection");
    ScriptedPeer::new(stream)
}

pub struct ScriptedPeer {
    stream: TcpStream,
    demux: Demultiplexer,
}

impl ScriptedPeer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            demux: Demultiplexer::new(Catalog::default()),
        }
    }

    /// Next message from the manager, or `None` once it hangs up
    pub async fn read_message(&mut self) -> Option<Message> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(message) = self.demux.read_next().expect("Manager sent a malformed frame") {
                return Some(message);
            }
            let read = tokio::time::timeout(STEP_TIMEOUT, self.stream.read(&mut chunk))
                .await
                .expect("Timed out waiting for a message")
                .ok()?;
            if read == 0 {
                return None;
            }
            self.demux.append(&chunk[..read]);
        }
    }

    pub async fn send(&mut self, message: &Message) {
        let bytes = wire::encode(message).expect("Failed to encode message");
        self.send_raw(&bytes).await;
    }

    pub async fn send_packet(&mut self, packet: &[u8]) {
        let mut bytes = Vec::new();
        wire::encode_packet(packet, &mut bytes).expect("Failed to encode packet");
        self.send_raw(&bytes).await;
    }

    pub async fn end_packet_stream(&mut self) {
        let mut bytes = Vec::new();
        wire::encode_packet_stream_end(&mut bytes);
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("Failed to write to the manager");
    }

    /// Wait until the manager side closes the socket
    pub async fn expect_eof(&mut self) {
        while self.read_message().await.is_some() {}
    }
}
