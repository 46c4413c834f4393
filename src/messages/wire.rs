//! Frame layout and the encode/decode paths for messages and bulk packets.
//!
//! Every message travels as a fixed 16-byte header followed by a
//! kind-specific body. All integers are little-endian:
//!
//! ```text
//! offset 0  : i32 kind (opcode)
//! offset 4  : i32 version.major
//! offset 8  : i32 version.minor
//! offset 12 : i32 length (header + body)
//! offset 16 : body
//! ```
//!
//! Bulk packets produced by the packet-stream serializer are carried as a
//! `u32` length prefix followed by the opaque packet bytes. A zero-length
//! packet ends the packet stream.

use crate::messages::catalog::Catalog;
use crate::messages::types::{Message, MessageKind, Payload, ProtocolVersion};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

// Wire protocol constants
pub const HEADER_SIZE: usize = 16;
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1MB including header
pub const PACKET_PREFIX_SIZE: usize = 4;
pub const MAX_PACKET_SIZE: usize = MAX_MESSAGE_SIZE;

/// Custom error types for wire protocol operations
#[derive(Error, Debug)]
pub enum WireProtocolError {
    #[error("Message too large: {size} bytes exceeds maximum of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Invalid length in frame header: {length}")]
    InvalidLength { length: i32 },

    #[error("Packet too large: {size} bytes exceeds maximum of {max_size} bytes")]
    PacketTooLarge { size: usize, max_size: usize },

    #[error("Unknown or unsupported message kind: opcode {opcode}")]
    UnknownMessageKind { opcode: i32 },

    #[error("Corrupted {kind} message ({length} bytes): {reason}")]
    CorruptedData {
        kind: MessageKind,
        length: usize,
        reason: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireProtocolError {
    /// Whether the byte stream can no longer be trusted to be frame-aligned.
    ///
    /// Only a body that failed to decode behind a sound header is recoverable;
    /// everything else ends the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireProtocolError::CorruptedData { .. })
    }
}

/// The fixed-size header in front of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub opcode: i32,
    pub version: ProtocolVersion,
    pub length: i32,
}

impl FrameHeader {
    pub fn new(kind: MessageKind, version: ProtocolVersion, length: usize) -> Self {
        Self {
            opcode: kind.opcode(),
            version,
            length: length as i32,
        }
    }

    /// Peek at the header at the start of `bytes` without consuming anything.
    ///
    /// Returns `None` while fewer than [`HEADER_SIZE`] bytes are available.
    pub fn try_read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let field = |offset: usize| {
            i32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        Some(Self {
            opcode: field(0),
            version: ProtocolVersion::new(field(4), field(8)),
            length: field(12),
        })
    }

    /// Check the declared length and return it as a byte count
    pub fn validate(&self) -> Result<usize, WireProtocolError> {
        if self.length < HEADER_SIZE as i32 {
            warn!(length = self.length, "Frame header declares a length smaller than the header");
            return Err(WireProtocolError::InvalidLength {
                length: self.length,
            });
        }
        let length = self.length as usize;
        if length > MAX_MESSAGE_SIZE {
            error!(
                length,
                max_size = MAX_MESSAGE_SIZE,
                "Frame header declares a length beyond the maximum message size"
            );
            return Err(WireProtocolError::MessageTooLarge {
                size: length,
                max_size: MAX_MESSAGE_SIZE,
            });
        }
        Ok(length)
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.extend_from_slice(&self.version.major.to_le_bytes());
        out.extend_from_slice(&self.version.minor.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
    }
}

/// A message decoded from a complete frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub message: Message,
    /// Total frame length, header included
    pub length: usize,
    /// The body decoder consumed a different number of bytes than the header
    /// declared and the cursor was forced back onto the frame boundary
    pub realigned: bool,
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
        .allow_trailing_bytes()
}

pub(crate) fn encode_body<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    body_options().serialize(value)
}

/// Decode a body value, reporting how many bytes the decoder actually consumed
pub(crate) fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<(T, usize), bincode::Error> {
    let mut cursor = Cursor::new(body);
    let value: T = body_options().deserialize_from(&mut cursor)?;
    Ok((value, cursor.position() as usize))
}

fn encode_payload(payload: &Payload) -> Result<Vec<u8>, bincode::Error> {
    match payload {
        Payload::LiveViewStart(body) => encode_body(body),
        Payload::LiveViewStop(body) => encode_body(body),
        Payload::SendSession(body) => encode_body(body),
        Payload::SessionHeader(body) => encode_body(body),
        Payload::RegisterAgent(body) => encode_body(body),
        Payload::RegisterAnalyst(body) => encode_body(body),
        Payload::SessionClosed(body) => encode_body(body),
        Payload::PacketStreamStart(body) => encode_body(body),
        Payload::ClockDrift(body) => encode_body(body),
        Payload::GetSessionHeaders
        | Payload::PauseSessionHeaders
        | Payload::ResumeSessionHeaders => Ok(Vec::new()),
    }
}

/// Append the encoded frame for `message` to `out`, returning the frame length.
///
/// The body is serialized first so the header can carry the final length.
#[instrument(level = "trace", skip(message, out), fields(kind = %message.kind()))]
pub fn encode_into(message: &Message, out: &mut Vec<u8>) -> Result<usize, WireProtocolError> {
    let body = encode_payload(message.payload())?;
    let length = HEADER_SIZE + body.len();
    if length > MAX_MESSAGE_SIZE {
        error!(
            size = length,
            max_size = MAX_MESSAGE_SIZE,
            "Refusing to encode message beyond the maximum message size"
        );
        return Err(WireProtocolError::MessageTooLarge {
            size: length,
            max_size: MAX_MESSAGE_SIZE,
        });
    }

    out.reserve(length);
    FrameHeader::new(message.kind(), message.version(), length).write_to(out);
    out.extend_from_slice(&body);
    trace!(length, "Encoded message frame");
    Ok(length)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, WireProtocolError> {
    let mut out = Vec::new();
    encode_into(message, &mut out)?;
    Ok(out)
}

/// Decode the frame at the start of `bytes`.
///
/// Returns `Ok(None)` when the frame has not fully arrived yet. A header that
/// is unusable (bad length, unknown opcode) is a fatal error; a body that
/// fails to decode yields [`WireProtocolError::CorruptedData`] carrying the
/// frame length so the caller can skip past it.
pub fn decode(catalog: &Catalog, bytes: &[u8]) -> Result<Option<DecodedFrame>, WireProtocolError> {
    let Some(header) = FrameHeader::try_read(bytes) else {
        return Ok(None);
    };
    let length = header.validate()?;
    if bytes.len() < length {
        return Ok(None);
    }
    decode_frame(catalog, &header, &bytes[..length]).map(Some)
}

/// Decode one complete frame whose header has already been read and validated
pub(crate) fn decode_frame(
    catalog: &Catalog,
    header: &FrameHeader,
    frame: &[u8],
) -> Result<DecodedFrame, WireProtocolError> {
    let entry = catalog.lookup(header.opcode)?;
    let length = frame.len();
    let body = &frame[HEADER_SIZE..];

    let (payload, consumed) = (entry.decode)(body).map_err(|e| {
        warn!(
            kind = %entry.kind,
            length,
            error = %e,
            "Failed to decode message body"
        );
        WireProtocolError::CorruptedData {
            kind: entry.kind,
            length,
            reason: e.to_string(),
        }
    })?;

    let realigned = consumed != body.len();
    if realigned {
        warn!(
            kind = %entry.kind,
            declared = body.len(),
            consumed,
            "Body decoder consumed a different byte count than declared; realigning to frame boundary"
        );
    }

    debug!(kind = %entry.kind, length, version = %header.version, "Decoded message frame");
    Ok(DecodedFrame {
        message: Message::with_version(header.version, payload),
        length,
        realigned,
    })
}

/// Append one bulk packet frame to `out`
pub fn encode_packet(packet: &[u8], out: &mut Vec<u8>) -> Result<(), WireProtocolError> {
    if packet.is_empty() {
        // An empty packet would be read back as the end-of-stream marker
        return Err(WireProtocolError::InvalidLength { length: 0 });
    }
    if packet.len() > MAX_PACKET_SIZE {
        return Err(WireProtocolError::PacketTooLarge {
            size: packet.len(),
            max_size: MAX_PACKET_SIZE,
        });
    }
    out.reserve(PACKET_PREFIX_SIZE + packet.len());
    out.extend_from_slice(&(packet.len() as u32).to_le_bytes());
    out.extend_from_slice(packet);
    Ok(())
}

/// The marker that ends a packet stream and returns the stream to message framing
pub fn encode_packet_stream_end(out: &mut Vec<u8>) {
    out.extend_from_slice(&0u32.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{ClockDrift, LiveViewStart, SessionClosed};
    use uuid::Uuid;

    fn sample_live_view_start() -> Message {
        Message::new(LiveViewStart::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            42,
        ))
    }

    #[test]
    fn test_header_layout_is_little_endian() {
        let message = Message::with_version(
            ProtocolVersion::new(1, 0),
            SessionClosed {
                session_id: Uuid::nil(),
            },
        );
        let bytes = encode(&message).unwrap();

        assert_eq!(&bytes[0..4], &8i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1i32.to_le_bytes());
        assert_eq!(&bytes[8..12], &0i32.to_le_bytes());
        assert_eq!(&bytes[12..16], &(bytes.len() as i32).to_le_bytes());
    }

    #[test]
    fn test_header_length_matches_bytes_consumed() {
        let catalog = Catalog::default();
        let message = sample_live_view_start();
        let mut bytes = encode(&message).unwrap();
        let header = FrameHeader::try_read(&bytes).unwrap();

        // Trailing bytes belong to the next frame and must not be consumed
        bytes.extend_from_slice(&[0xAB; 7]);
        let decoded = decode(&catalog, &bytes).unwrap().unwrap();

        assert_eq!(decoded.length, header.length as usize);
        assert_eq!(decoded.length, bytes.len() - 7);
        assert!(!decoded.realigned);
        assert_eq!(decoded.message, message);
    }

    #[test]
    fn test_try_read_needs_full_header() {
        let bytes = encode(&sample_live_view_start()).unwrap();
        for available in 0..HEADER_SIZE {
            assert!(FrameHeader::try_read(&bytes[..available]).is_none());
        }
        assert!(FrameHeader::try_read(&bytes[..HEADER_SIZE]).is_some());
    }

    #[test]
    fn test_decode_incomplete_frame_returns_none() {
        let catalog = Catalog::default();
        let bytes = encode(&sample_live_view_start()).unwrap();
        assert!(decode(&catalog, &bytes[..bytes.len() - 1]).unwrap().is_none());
        assert!(decode(&catalog, &bytes[..3]).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let catalog = Catalog::default();
        let mut bytes = Vec::new();
        FrameHeader {
            opcode: MessageKind::SessionClosed.opcode(),
            version: ProtocolVersion::CURRENT,
            length: (MAX_MESSAGE_SIZE + 1) as i32,
        }
        .write_to(&mut bytes);

        let err = decode(&catalog, &bytes).unwrap_err();
        assert!(matches!(err, WireProtocolError::MessageTooLarge { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_length_below_header_size_is_fatal() {
        let catalog = Catalog::default();
        for length in [-1, 0, 15] {
            let mut bytes = Vec::new();
            FrameHeader {
                opcode: MessageKind::SessionClosed.opcode(),
                version: ProtocolVersion::CURRENT,
                length,
            }
            .write_to(&mut bytes);
            let err = decode(&catalog, &bytes).unwrap_err();
            assert!(matches!(err, WireProtocolError::InvalidLength { .. }));
        }
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let catalog = Catalog::default();
        let mut bytes = Vec::new();
        FrameHeader {
            opcode: 999,
            version: ProtocolVersion::CURRENT,
            length: HEADER_SIZE as i32,
        }
        .write_to(&mut bytes);

        let err = decode(&catalog, &bytes).unwrap_err();
        assert!(matches!(err, WireProtocolError::UnknownMessageKind { opcode: 999 }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_corrupted_body_reports_frame_length() {
        let catalog = Catalog::default();
        let mut bytes = encode(&sample_live_view_start()).unwrap();
        let length = bytes.len();
        // Truncate the body while keeping the declared length: shrink the frame
        // to just the header plus 3 bytes and fix up the header length
        bytes.truncate(HEADER_SIZE + 3);
        bytes[12..16].copy_from_slice(&((HEADER_SIZE + 3) as i32).to_le_bytes());

        let err = decode(&catalog, &bytes).unwrap_err();
        match err {
            WireProtocolError::CorruptedData { kind, length: reported, .. } => {
                assert_eq!(kind, MessageKind::LiveViewStart);
                assert_eq!(reported, HEADER_SIZE + 3);
                assert_ne!(reported, length);
            }
            other => panic!("expected corrupted data, got {other:?}"),
        }
    }

    #[test]
    fn test_extra_body_bytes_are_realigned() {
        let catalog = Catalog::default();
        let message = Message::new(ClockDrift::at(7));
        let mut bytes = encode(&message).unwrap();
        bytes.extend_from_slice(&[0u8; 5]);
        let length = bytes.len();
        bytes[12..16].copy_from_slice(&(length as i32).to_le_bytes());

        let decoded = decode(&catalog, &bytes).unwrap().unwrap();
        assert!(decoded.realigned);
        assert_eq!(decoded.length, length);
        assert_eq!(decoded.message, message);
    }

    #[test]
    fn test_empty_body_kinds() {
        let catalog = Catalog::default();
        for payload in [
            Payload::GetSessionHeaders,
            Payload::PauseSessionHeaders,
            Payload::ResumeSessionHeaders,
        ] {
            let message = Message::new(payload);
            let bytes = encode(&message).unwrap();
            assert_eq!(bytes.len(), HEADER_SIZE);
            assert_eq!(decode(&catalog, &bytes).unwrap().unwrap().message, message);
        }
    }

    #[test]
    fn test_packet_framing() {
        let mut out = Vec::new();
        encode_packet(b"abc", &mut out).unwrap();
        encode_packet_stream_end(&mut out);
        assert_eq!(out, vec![3, 0, 0, 0, b'a', b'b', b'c', 0, 0, 0, 0]);

        assert!(encode_packet(&[], &mut out).is_err());
    }
}
