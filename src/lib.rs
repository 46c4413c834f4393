pub mod cli;
pub mod messages;
pub mod network;

// Re-export key types for easy testing
pub use messages::{Catalog, Demultiplexer, Message, MessageKind, Payload, ProtocolVersion};
pub use network::{Connection, ConnectionConfig, ConnectionError, ConnectionManager, ProtocolHandler, Server};
