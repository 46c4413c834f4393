pub mod backoff;
pub mod client;
pub mod connection;
pub mod events;
pub mod handler;
pub mod manager;
pub mod server;
pub mod tls;

pub use backoff::{retry_delay, Backoff, RetryDecision};
pub use client::Endpoint;
pub use connection::{Connection, ConnectionError, READ_CHUNK_SIZE};
pub use events::{ConnectionEvent, ConnectionState};
pub use handler::ProtocolHandler;
pub use manager::{ConnectionConfig, ConnectionManager};
pub use server::{HandlerFactory, Server};
