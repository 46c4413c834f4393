use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Protocol version carried in every frame header.
///
/// Minor revisions of the same major version are backward compatible: a 1.1
/// peer understands everything a 1.0 peer sends, but not the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: i32,
    pub minor: i32,
}

impl ProtocolVersion {
    pub const V1_0: ProtocolVersion = ProtocolVersion::new(1, 0);
    pub const V1_1: ProtocolVersion = ProtocolVersion::new(1, 1);
    pub const CURRENT: ProtocolVersion = ProtocolVersion::V1_1;

    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    /// Whether a peer speaking this version can decode something introduced in `introduced`
    pub fn supports(self, introduced: ProtocolVersion) -> bool {
        self.major == introduced.major && self.minor >= introduced.minor
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Opcodes of every message shape known to this implementation.
///
/// Values are part of the wire format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(i32)]
pub enum MessageKind {
    LiveViewStart = 1,
    LiveViewStop = 2,
    SendSession = 3,
    SessionHeader = 4,
    GetSessionHeaders = 5,
    RegisterAgent = 6,
    RegisterAnalyst = 7,
    SessionClosed = 8,
    PacketStreamStart = 9,
    ClockDrift = 10,
    PauseSessionHeaders = 11,
    ResumeSessionHeaders = 12,
}

impl MessageKind {
    pub const ALL: [MessageKind; 12] = [
        MessageKind::LiveViewStart,
        MessageKind::LiveViewStop,
        MessageKind::SendSession,
        MessageKind::SessionHeader,
        MessageKind::GetSessionHeaders,
        MessageKind::RegisterAgent,
        MessageKind::RegisterAnalyst,
        MessageKind::SessionClosed,
        MessageKind::PacketStreamStart,
        MessageKind::ClockDrift,
        MessageKind::PauseSessionHeaders,
        MessageKind::ResumeSessionHeaders,
    ];

    pub fn opcode(self) -> i32 {
        self as i32
    }

    pub fn from_opcode(opcode: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.opcode() == opcode)
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageKind::LiveViewStart => "LiveViewStart",
            MessageKind::LiveViewStop => "LiveViewStop",
            MessageKind::SendSession => "SendSession",
            MessageKind::SessionHeader => "SessionHeader",
            MessageKind::GetSessionHeaders => "GetSessionHeaders",
            MessageKind::RegisterAgent => "RegisterAgent",
            MessageKind::RegisterAnalyst => "RegisterAnalyst",
            MessageKind::SessionClosed => "SessionClosed",
            MessageKind::PacketStreamStart => "PacketStreamStart",
            MessageKind::ClockDrift => "ClockDrift",
            MessageKind::PauseSessionHeaders => "PauseSessionHeaders",
            MessageKind::ResumeSessionHeaders => "ResumeSessionHeaders",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validation failures for message fields that must be checked before use
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("session id must not be empty")]
    EmptySessionId,

    #[error("channel id must not be empty")]
    EmptyChannelId,
}

/// Ask the peer to start streaming a live session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveViewStart {
    pub repository_id: Uuid,
    pub session_id: Uuid,
    /// Correlates the live stream with the requesting view
    pub channel_id: Uuid,
    /// Packet sequence number to resume from; 0 streams from the beginning
    pub sequence_offset: i64,
}

impl LiveViewStart {
    pub fn new(repository_id: Uuid, session_id: Uuid, channel_id: Uuid, sequence_offset: i64) -> Self {
        Self {
            repository_id,
            session_id,
            channel_id,
            sequence_offset,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.channel_id.is_nil() {
            return Err(ValidationError::EmptyChannelId);
        }
        if self.session_id.is_nil() {
            return Err(ValidationError::EmptySessionId);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveViewStop {
    pub session_id: Uuid,
    pub channel_id: Uuid,
}

/// Bit set selecting which sessions a `SendSession` request covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionCriteria(pub u32);

impl SessionCriteria {
    pub const NONE: SessionCriteria = SessionCriteria(0);
    pub const ACTIVE: SessionCriteria = SessionCriteria(1);
    pub const NEW: SessionCriteria = SessionCriteria(1 << 1);
    pub const COMPLETED: SessionCriteria = SessionCriteria(1 << 2);
    pub const CRITICAL: SessionCriteria = SessionCriteria(1 << 3);
    pub const ERROR: SessionCriteria = SessionCriteria(1 << 4);
    pub const WARNING: SessionCriteria = SessionCriteria(1 << 5);
    pub const ALL: SessionCriteria = SessionCriteria(0b11_1111);

    pub fn contains(self, other: SessionCriteria) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SessionCriteria {
    type Output = SessionCriteria;

    fn bitor(self, rhs: Self) -> Self::Output {
        SessionCriteria(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendSession {
    /// Nil means "every session matching the criteria"
    pub session_id: Uuid,
    pub criteria: SessionCriteria,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Running,
    Normal,
    Crashed,
}

/// Summary of a session, sent ahead of its packets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub session_id: Uuid,
    pub product: String,
    pub application: String,
    pub host_name: String,
    /// Microseconds since the Unix epoch
    pub started_at: i64,
    pub ended_at: Option<i64>,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAgent {
    pub session_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAnalyst {
    pub client_id: Uuid,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClosed {
    pub session_id: Uuid,
}

/// Announces that bulk packets for a session follow on the stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketStreamStart {
    pub session_id: Uuid,
}

/// Round-trip timestamp exchange used to estimate latency and clock skew.
///
/// The originator stamps its own clock and sends the message; the destination
/// answers with the same id and its own clock filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockDrift {
    pub id: Uuid,
    pub originator_timestamp: i64,
    pub destination_timestamp: Option<i64>,
}

impl ClockDrift {
    pub fn new() -> Self {
        Self::at(now_micros())
    }

    pub fn at(originator_timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            originator_timestamp,
            destination_timestamp: None,
        }
    }

    /// The reply a destination sends back, stamped with its own clock
    pub fn answered_at(self, destination_timestamp: i64) -> Self {
        Self {
            destination_timestamp: Some(destination_timestamp),
            ..self
        }
    }

    pub fn is_answered(&self) -> bool {
        self.destination_timestamp.is_some()
    }

    /// Time between sending and receiving the answer, both on the originator's clock
    pub fn round_trip(&self, received_at: i64) -> Duration {
        let micros = received_at.saturating_sub(self.originator_timestamp).max(0);
        Duration::from_micros(micros as u64)
    }

    pub fn one_way_latency(&self, received_at: i64) -> Duration {
        self.round_trip(received_at) / 2
    }

    /// How far the destination clock runs ahead of ours, in microseconds
    pub fn clock_skew(&self, received_at: i64) -> Option<i64> {
        let destination = self.destination_timestamp?;
        let latency = self.one_way_latency(received_at).as_micros() as i64;
        Some(
            destination
                .saturating_sub(self.originator_timestamp)
                .saturating_sub(latency),
        )
    }
}

impl Default for ClockDrift {
    fn default() -> Self {
        Self::new()
    }
}

/// Microseconds since the Unix epoch on the local clock
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as i64)
        .unwrap_or_default()
}

/// Kind-specific content of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    LiveViewStart(LiveViewStart),
    LiveViewStop(LiveViewStop),
    SendSession(SendSession),
    SessionHeader(SessionHeader),
    GetSessionHeaders,
    RegisterAgent(RegisterAgent),
    RegisterAnalyst(RegisterAnalyst),
    SessionClosed(SessionClosed),
    PacketStreamStart(PacketStreamStart),
    ClockDrift(ClockDrift),
    PauseSessionHeaders,
    ResumeSessionHeaders,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::LiveViewStart(_) => MessageKind::LiveViewStart,
            Payload::LiveViewStop(_) => MessageKind::LiveViewStop,
            Payload::SendSession(_) => MessageKind::SendSession,
            Payload::SessionHeader(_) => MessageKind::SessionHeader,
            Payload::GetSessionHeaders => MessageKind::GetSessionHeaders,
            Payload::RegisterAgent(_) => MessageKind::RegisterAgent,
            Payload::RegisterAnalyst(_) => MessageKind::RegisterAnalyst,
            Payload::SessionClosed(_) => MessageKind::SessionClosed,
            Payload::PacketStreamStart(_) => MessageKind::PacketStreamStart,
            Payload::ClockDrift(_) => MessageKind::ClockDrift,
            Payload::PauseSessionHeaders => MessageKind::PauseSessionHeaders,
            Payload::ResumeSessionHeaders => MessageKind::ResumeSessionHeaders,
        }
    }
}

macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Payload {
                fn from(value: $variant) -> Self {
                    Payload::$variant(value)
                }
            }
        )*
    };
}

payload_from!(
    LiveViewStart,
    LiveViewStop,
    SendSession,
    SessionHeader,
    RegisterAgent,
    RegisterAnalyst,
    SessionClosed,
    PacketStreamStart,
    ClockDrift,
);

/// One typed, versioned unit of protocol exchange.
///
/// Messages are immutable values: the header fields (`kind`, `version`,
/// `length`) are derived from the payload when the message is encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    version: ProtocolVersion,
    payload: Payload,
}

impl Message {
    /// Create a message at the current protocol version
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::with_version(ProtocolVersion::CURRENT, payload)
    }

    pub fn with_version(version: ProtocolVersion, payload: impl Into<Payload>) -> Self {
        Self {
            version,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Get the message type as a string
    pub fn message_type(&self) -> &'static str {
        self.kind().name()
    }
}
