//! Incremental reassembly of messages and bulk packets from a byte stream.
//!
//! Bytes arrive in arbitrary chunks through [`Demultiplexer::append`]; whole
//! frames come out of [`Demultiplexer::read_next`] (messages) and
//! [`Demultiplexer::read_next_packet`] (packets, while a packet stream is
//! active). Nothing is consumed until a complete frame is buffered.

use crate::messages::catalog::Catalog;
use crate::messages::types::Message;
use crate::messages::wire::{
    self, FrameHeader, WireProtocolError, MAX_PACKET_SIZE, PACKET_PREFIX_SIZE,
};
use tracing::{debug, error, trace, warn};

/// Consumed bytes are reclaimed once the consumed prefix grows past this size
pub const RECLAIM_THRESHOLD: usize = 32 * 1024;

/// Counters describing what the demultiplexer has seen so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub messages_decoded: u64,
    pub packets_decoded: u64,
    /// Messages discarded because their body failed to decode
    pub corrupted_messages: u64,
    /// Messages whose decoder disagreed with the declared length
    pub realigned_messages: u64,
}

/// One unit read while a packet stream is active
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketFrame {
    Packet(Vec<u8>),
    /// The zero-length marker: message framing resumes after it
    EndOfStream,
}

#[derive(Debug)]
pub struct Demultiplexer {
    catalog: Catalog,
    buffer: Vec<u8>,
    read_pos: usize,
    bytes_required: usize,
    stats: DemuxStats,
}

impl Demultiplexer {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog,
            buffer: Vec::new(),
            read_pos: 0,
            bytes_required: 0,
            stats: DemuxStats::default(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Append freshly received bytes
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(data);
        self.bytes_required = self.bytes_required.saturating_sub(data.len());
        trace!(appended = data.len(), buffered = self.buffered(), "Appended to stream buffer");
    }

    /// Return the next complete message, or `None` if more bytes are needed.
    ///
    /// Messages whose body fails to decode are skipped and counted; decoding
    /// continues with the following frame. Fatal framing errors are returned
    /// to the caller and leave the buffer untouched.
    pub fn read_next(&mut self) -> Result<Option<Message>, WireProtocolError> {
        loop {
            let pending = &self.buffer[self.read_pos..];
            let Some(header) = FrameHeader::try_read(pending) else {
                self.bytes_required = 0;
                return Ok(None);
            };
            let length = header.validate()?;
            if pending.len() < length {
                self.bytes_required = length - pending.len();
                trace!(
                    length,
                    missing = self.bytes_required,
                    "Frame header available, waiting for body"
                );
                return Ok(None);
            }

            let outcome = wire::decode_frame(&self.catalog, &header, &pending[..length]);
            match outcome {
                Ok(decoded) => {
                    self.consume(decoded.length);
                    self.stats.messages_decoded += 1;
                    if decoded.realigned {
                        self.stats.realigned_messages += 1;
                    }
                    return Ok(Some(decoded.message));
                }
                Err(WireProtocolError::CorruptedData { kind, length, reason }) => {
                    self.stats.corrupted_messages += 1;
                    warn!(
                        %kind,
                        length,
                        reason = %reason,
                        corrupted_messages = self.stats.corrupted_messages,
                        "Discarding corrupted message and resuming at next frame boundary"
                    );
                    self.consume(length);
                }
                Err(e) => {
                    error!(error = %e, "Fatal framing error; stream is no longer aligned");
                    return Err(e);
                }
            }
        }
    }

    /// Return the next bulk packet frame, or `None` if more bytes are needed
    pub fn read_next_packet(&mut self) -> Result<Option<PacketFrame>, WireProtocolError> {
        let pending = &self.buffer[self.read_pos..];
        if pending.len() < PACKET_PREFIX_SIZE {
            self.bytes_required = 0;
            return Ok(None);
        }
        let length = u32::from_le_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
        if length > MAX_PACKET_SIZE {
            error!(length, max_size = MAX_PACKET_SIZE, "Packet length beyond the maximum packet size");
            return Err(WireProtocolError::PacketTooLarge {
                size: length,
                max_size: MAX_PACKET_SIZE,
            });
        }
        if length == 0 {
            self.consume(PACKET_PREFIX_SIZE);
            debug!("End of packet stream");
            return Ok(Some(PacketFrame::EndOfStream));
        }

        let total = PACKET_PREFIX_SIZE + length;
        if pending.len() < total {
            self.bytes_required = total - pending.len();
            return Ok(None);
        }
        let packet = pending[PACKET_PREFIX_SIZE..total].to_vec();
        self.consume(total);
        self.stats.packets_decoded += 1;
        Ok(Some(PacketFrame::Packet(packet)))
    }

    /// Bytes still missing from the frame currently at the cursor; 0 when unknown
    pub fn bytes_required(&self) -> usize {
        self.bytes_required
    }

    /// Bytes received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Total size of the underlying buffer, consumed prefix included
    pub fn capacity_in_use(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes currently allocated for the stream buffer
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats
    }

    pub fn has_corrupt_data(&self) -> bool {
        self.stats.corrupted_messages > 0
    }

    fn consume(&mut self, count: usize) {
        self.read_pos += count;
        self.bytes_required = 0;
        if self.read_pos == self.buffer.len() {
            // Nothing pending: reuse the allocation unless a large frame grew it
            if self.buffer.capacity() > RECLAIM_THRESHOLD {
                debug!(capacity = self.buffer.capacity(), "Releasing oversized stream buffer");
                self.buffer = Vec::new();
            } else {
                self.buffer.clear();
            }
            self.read_pos = 0;
        } else if self.read_pos > RECLAIM_THRESHOLD {
            self.compact();
        }
    }

    fn compact(&mut self) {
        let tail = self.buffer[self.read_pos..].to_vec();
        debug!(
            reclaimed = self.read_pos,
            retained = tail.len(),
            "Compacting stream buffer"
        );
        self.buffer = tail;
        self.read_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::types::{
        ClockDrift, LiveViewStart, MessageKind, ProtocolVersion, SessionClosed,
    };
    use crate::messages::wire::{
        encode, encode_packet, encode_packet_stream_end, HEADER_SIZE, MAX_MESSAGE_SIZE,
    };
    use uuid::Uuid;

    fn live_view_start() -> Message {
        Message::new(LiveViewStart::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            0,
        ))
    }

    fn session_closed() -> Message {
        Message::new(SessionClosed {
            session_id: Uuid::new_v4(),
        })
    }

    #[test]
    fn test_single_byte_chunks() {
        let messages = vec![live_view_start(), session_closed(), Message::new(ClockDrift::at(-1))];
        let mut bytes = Vec::new();
        for message in &messages {
            bytes.extend(encode(message).unwrap());
        }

        let mut demux = Demultiplexer::new(Catalog::default());
        let mut received = Vec::new();
        for byte in bytes {
            demux.append(&[byte]);
            while let Some(message) = demux.read_next().unwrap() {
                received.push(message);
            }
        }

        assert_eq!(received, messages);
        assert_eq!(demux.buffered(), 0);
        assert_eq!(demux.stats().messages_decoded, 3);
    }

    #[test]
    fn test_bytes_required_hint() {
        let bytes = encode(&live_view_start()).unwrap();
        let mut demux = Demultiplexer::new(Catalog::default());

        demux.append(&bytes[..10]);
        assert!(demux.read_next().unwrap().is_none());
        assert_eq!(demux.bytes_required(), 0, "header incomplete: requirement unknown");

        demux.append(&bytes[10..HEADER_SIZE + 4]);
        assert!(demux.read_next().unwrap().is_none());
        assert_eq!(demux.bytes_required(), bytes.len() - (HEADER_SIZE + 4));

        demux.append(&bytes[HEADER_SIZE + 4..]);
        assert!(demux.read_next().unwrap().is_some());
        assert_eq!(demux.bytes_required(), 0);
    }

    #[test]
    fn test_read_next_without_new_data_is_idempotent() {
        let bytes = encode(&live_view_start()).unwrap();
        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&bytes[..bytes.len() - 1]);

        for _ in 0..5 {
            assert!(demux.read_next().unwrap().is_none());
            assert_eq!(demux.buffered(), bytes.len() - 1);
        }

        demux.append(&bytes[bytes.len() - 1..]);
        assert!(demux.read_next().unwrap().is_some());
    }

    #[test]
    fn test_corrupted_message_is_isolated() {
        let first = live_view_start();
        let second = session_closed();
        let mut corrupted = encode(&live_view_start()).unwrap();
        // Huge string/bytes length prefix in the body; header left intact
        for byte in &mut corrupted[HEADER_SIZE..] {
            *byte = 0xFF;
        }

        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&encode(&first).unwrap());
        demux.append(&corrupted);
        demux.append(&encode(&second).unwrap());

        assert_eq!(demux.read_next().unwrap(), Some(first));
        assert_eq!(demux.read_next().unwrap(), Some(second));
        assert_eq!(demux.read_next().unwrap(), None);
        assert_eq!(demux.stats().corrupted_messages, 1);
        assert!(demux.has_corrupt_data());
    }

    #[test]
    fn test_oversized_header_is_fatal_not_pending() {
        let mut bytes = Vec::new();
        FrameHeader {
            opcode: MessageKind::SessionClosed.opcode(),
            version: ProtocolVersion::CURRENT,
            length: i32::MAX,
        }
        .write_to(&mut bytes);

        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&bytes);
        let err = demux.read_next().unwrap_err();
        assert!(matches!(
            err,
            WireProtocolError::MessageTooLarge { max_size: MAX_MESSAGE_SIZE, .. }
        ));
    }

    #[test]
    fn test_buffer_is_compacted() {
        let message = live_view_start();
        let frame = encode(&message).unwrap();
        let mut demux = Demultiplexer::new(Catalog::default());

        // Keep a partial frame pending so the buffer never drains completely
        let frames = RECLAIM_THRESHOLD / frame.len() + 10;
        for _ in 0..frames {
            demux.append(&frame);
        }
        demux.append(&frame[..5]);

        for _ in 0..frames {
            assert!(demux.read_next().unwrap().is_some());
        }
        assert!(demux.read_next().unwrap().is_none());
        assert_eq!(demux.buffered(), 5);
        assert!(demux.capacity() <= RECLAIM_THRESHOLD + frame.len());
    }

    #[test]
    fn test_large_frame_does_not_pin_memory() {
        let mut bytes = Vec::new();
        encode_packet(&vec![0x5A; 900 * 1024], &mut bytes).unwrap();
        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&bytes);
        assert!(demux.capacity() >= bytes.len());

        assert!(matches!(demux.read_next_packet().unwrap(), Some(PacketFrame::Packet(p)) if p.len() == 900 * 1024));
        assert_eq!(demux.buffered(), 0);
        assert!(demux.capacity() <= RECLAIM_THRESHOLD);

        // Small frames keep reusing a modest allocation
        let message = live_view_start();
        demux.append(&encode(&message).unwrap());
        assert_eq!(demux.read_next().unwrap(), Some(message));
        assert!(demux.capacity() > 0 && demux.capacity() <= RECLAIM_THRESHOLD);
    }

    #[test]
    fn test_packets_between_messages() {
        let header = live_view_start();
        let closed = session_closed();
        let mut bytes = encode(&header).unwrap();
        encode_packet(b"first record", &mut bytes).unwrap();
        encode_packet(b"second record", &mut bytes).unwrap();
        encode_packet_stream_end(&mut bytes);
        bytes.extend(encode(&closed).unwrap());

        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&bytes);

        assert_eq!(demux.read_next().unwrap(), Some(header));
        assert_eq!(
            demux.read_next_packet().unwrap(),
            Some(PacketFrame::Packet(b"first record".to_vec()))
        );
        assert_eq!(
            demux.read_next_packet().unwrap(),
            Some(PacketFrame::Packet(b"second record".to_vec()))
        );
        assert_eq!(demux.read_next_packet().unwrap(), Some(PacketFrame::EndOfStream));
        assert_eq!(demux.read_next().unwrap(), Some(closed));
        assert_eq!(demux.stats().packets_decoded, 2);
    }

    #[test]
    fn test_partial_packet_waits() {
        let mut bytes = Vec::new();
        encode_packet(&[7u8; 100], &mut bytes).unwrap();

        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&bytes[..2]);
        assert_eq!(demux.read_next_packet().unwrap(), None);
        demux.append(&bytes[2..50]);
        assert_eq!(demux.read_next_packet().unwrap(), None);
        assert_eq!(demux.bytes_required(), bytes.len() - 50);
        demux.append(&bytes[50..]);
        assert_eq!(
            demux.read_next_packet().unwrap(),
            Some(PacketFrame::Packet(vec![7u8; 100]))
        );
    }

    #[test]
    fn test_oversized_packet_is_fatal() {
        let mut demux = Demultiplexer::new(Catalog::default());
        demux.append(&((MAX_PACKET_SIZE + 1) as u32).to_le_bytes());
        assert!(matches!(
            demux.read_next_packet(),
            Err(WireProtocolError::PacketTooLarge { .. })
        ));
    }
}
