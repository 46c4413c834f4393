pub mod catalog;
pub mod demux;
pub mod types;
pub mod wire;

pub use catalog::Catalog;
pub use demux::{DemuxStats, Demultiplexer, PacketFrame};
pub use types::{
    ClockDrift, LiveViewStart, LiveViewStop, Message, MessageKind, PacketStreamStart, Payload,
    ProtocolVersion, RegisterAgent, RegisterAnalyst, SendSession, SessionClosed, SessionCriteria,
    SessionHeader, SessionStatus, ValidationError,
};
pub use wire::{
    // Wire protocol constants
    HEADER_SIZE,
    MAX_MESSAGE_SIZE,
    MAX_PACKET_SIZE,
    PACKET_PREFIX_SIZE,
    WireProtocolError,
};
