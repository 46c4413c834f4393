//! Registration table mapping opcodes to body decoders.
//!
//! The table is a constant: adding a message kind means adding a row here and
//! a variant to [`Payload`]. A [`Catalog`] is the per-connection view of the
//! table, narrowed to the kinds the negotiated protocol version (and the
//! protocol handler) expects.

use crate::messages::types::{
    ClockDrift, LiveViewStart, LiveViewStop, MessageKind, PacketStreamStart, Payload,
    ProtocolVersion, RegisterAgent, RegisterAnalyst, SendSession, SessionClosed, SessionHeader,
};
use crate::messages::wire::{decode_body, WireProtocolError};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Decodes a body into its payload, reporting the bytes consumed
pub type BodyDecoder = fn(&[u8]) -> Result<(Payload, usize), bincode::Error>;

/// One row of the registration table
pub struct KindEntry {
    pub kind: MessageKind,
    /// First protocol version in which this kind exists
    pub introduced: ProtocolVersion,
    pub decode: BodyDecoder,
}

impl fmt::Debug for KindEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindEntry")
            .field("kind", &self.kind)
            .field("introduced", &self.introduced)
            .finish_non_exhaustive()
    }
}

macro_rules! body_decoder {
    ($name:ident, $variant:ident) => {
        fn $name(body: &[u8]) -> Result<(Payload, usize), bincode::Error> {
            let (value, consumed) = decode_body::<$variant>(body)?;
            Ok((Payload::$variant(value), consumed))
        }
    };
    ($name:ident, $variant:ident, empty) => {
        fn $name(_body: &[u8]) -> Result<(Payload, usize), bincode::Error> {
            Ok((Payload::$variant, 0))
        }
    };
}

body_decoder!(decode_live_view_start, LiveViewStart);
body_decoder!(decode_live_view_stop, LiveViewStop);
body_decoder!(decode_send_session, SendSession);
body_decoder!(decode_session_header, SessionHeader);
body_decoder!(decode_get_session_headers, GetSessionHeaders, empty);
body_decoder!(decode_register_agent, RegisterAgent);
body_decoder!(decode_register_analyst, RegisterAnalyst);
body_decoder!(decode_session_closed, SessionClosed);
body_decoder!(decode_packet_stream_start, PacketStreamStart);
body_decoder!(decode_clock_drift, ClockDrift);
body_decoder!(decode_pause_session_headers, PauseSessionHeaders, empty);
body_decoder!(decode_resume_session_headers, ResumeSessionHeaders, empty);

static REGISTRY: [KindEntry; 12] = [
    KindEntry {
        kind: MessageKind::LiveViewStart,
        introduced: ProtocolVersion::V1_0,
        decode: decode_live_view_start,
    },
    KindEntry {
        kind: MessageKind::LiveViewStop,
        introduced: ProtocolVersion::V1_0,
        decode: decode_live_view_stop,
    },
    KindEntry {
        kind: MessageKind::SendSession,
        introduced: ProtocolVersion::V1_0,
        decode: decode_send_session,
    },
    KindEntry {
        kind: MessageKind::SessionHeader,
        introduced: ProtocolVersion::V1_0,
        decode: decode_session_header,
    },
    KindEntry {
        kind: MessageKind::GetSessionHeaders,
        introduced: ProtocolVersion::V1_0,
        decode: decode_get_session_headers,
    },
    KindEntry {
        kind: MessageKind::RegisterAgent,
        introduced: ProtocolVersion::V1_0,
        decode: decode_register_agent,
    },
    KindEntry {
        kind: MessageKind::RegisterAnalyst,
        introduced: ProtocolVersion::V1_0,
        decode: decode_register_analyst,
    },
    KindEntry {
        kind: MessageKind::SessionClosed,
        introduced: ProtocolVersion::V1_0,
        decode: decode_session_closed,
    },
    KindEntry {
        kind: MessageKind::PacketStreamStart,
        introduced: ProtocolVersion::V1_0,
        decode: decode_packet_stream_start,
    },
    KindEntry {
        kind: MessageKind::ClockDrift,
        introduced: ProtocolVersion::V1_0,
        decode: decode_clock_drift,
    },
    KindEntry {
        kind: MessageKind::PauseSessionHeaders,
        introduced: ProtocolVersion::V1_1,
        decode: decode_pause_session_headers,
    },
    KindEntry {
        kind: MessageKind::ResumeSessionHeaders,
        introduced: ProtocolVersion::V1_1,
        decode: decode_resume_session_headers,
    },
];

/// Every row of the registration table
pub fn registered_kinds() -> &'static [KindEntry] {
    &REGISTRY
}

fn entry_for(kind: MessageKind) -> &'static KindEntry {
    // The table is indexed by opcode - 1
    &REGISTRY[(kind.opcode() - 1) as usize]
}

/// The set of message kinds a connection is prepared to decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    version: ProtocolVersion,
    enabled: BTreeSet<MessageKind>,
}

impl Catalog {
    /// Every kind the given protocol version supports
    pub fn for_version(version: ProtocolVersion) -> Self {
        let enabled = REGISTRY
            .iter()
            .filter(|entry| version.supports(entry.introduced))
            .map(|entry| entry.kind)
            .collect();
        Self { version, enabled }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn enable(&mut self, kind: MessageKind) -> &mut Self {
        self.enabled.insert(kind);
        self
    }

    pub fn disable(&mut self, kind: MessageKind) -> &mut Self {
        self.enabled.remove(&kind);
        self
    }

    /// Restrict the catalog to exactly `kinds`
    pub fn restrict_to(&mut self, kinds: &[MessageKind]) -> &mut Self {
        self.enabled = kinds.iter().copied().collect();
        self
    }

    pub fn supports(&self, kind: MessageKind) -> bool {
        self.enabled.contains(&kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = MessageKind> + '_ {
        self.enabled.iter().copied()
    }

    /// Find the decoder for an opcode read off the wire
    pub fn lookup(&self, opcode: i32) -> Result<&'static KindEntry, WireProtocolError> {
        match MessageKind::from_opcode(opcode) {
            Some(kind) if self.supports(kind) => Ok(entry_for(kind)),
            _ => {
                debug!(opcode, version = %self.version, "Opcode is not in the connection catalog");
                Err(WireProtocolError::UnknownMessageKind { opcode })
            }
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::for_version(ProtocolVersion::CURRENT)
    }
}
