mod common;

use common::test_data::{encode_all, sample_messages, session_header};
use sessionlink::messages::demux::{Demultiplexer, PacketFrame, RECLAIM_THRESHOLD};
use sessionlink::messages::types::{Message, PacketStreamStart, SessionClosed};
use sessionlink::messages::wire::{self, WireProtocolError, HEADER_SIZE};
use sessionlink::messages::Catalog;
use uuid::Uuid;

fn drain(demux: &mut Demultiplexer) -> Vec<Message> {
    let mut out = Vec::new();
    while let Some(message) = demux.read_next().unwrap() {
        out.push(message);
    }
    out
}

#[test]
fn test_chunk_size_does_not_change_output() {
    let messages = sample_messages();
    let stream = encode_all(&messages);

    for chunk_size in [1, 2, 3, 7, 16, 17, 100, 10_240, stream.len()] {
        let mut demux = Demultiplexer::new(Catalog::default());
        let mut decoded = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            demux.append(chunk);
            decoded.extend(drain(&mut demux));
        }
        assert_eq!(decoded, messages, "chunk size {}", chunk_size);
        assert_eq!(demux.buffered(), 0);
        assert_eq!(demux.stats().messages_decoded, messages.len() as u64);
    }
}

#[test]
fn test_repeated_reads_without_data_are_harmless() {
    let message = Message::new(session_header(Uuid::new_v4()));
    let bytes = wire::encode(&message).unwrap();
    let mut demux = Demultiplexer::new(Catalog::default());

    demux.append(&bytes[..HEADER_SIZE + 3]);
    for _ in 0..10 {
        assert_eq!(demux.read_next().unwrap(), None);
        assert_eq!(demux.buffered(), HEADER_SIZE + 3);
        assert_eq!(demux.bytes_required(), bytes.len() - HEADER_SIZE - 3);
    }

    demux.append(&bytes[HEADER_SIZE + 3..]);
    assert_eq!(demux.read_next().unwrap(), Some(message));
    assert_eq!(demux.read_next().unwrap(), None);
}

#[test]
fn test_corrupted_message_between_valid_ones() {
    let session_id = Uuid::new_v4();
    let first = Message::new(SessionClosed { session_id });
    let second = Message::new(PacketStreamStart { session_id });

    let mut corrupted = wire::encode(&Message::new(session_header(session_id))).unwrap();
    for byte in &mut corrupted[HEADER_SIZE..] {
        *byte = 0xFF;
    }

    let mut stream = wire::encode(&first).unwrap();
    stream.extend_from_slice(&corrupted);
    stream.extend_from_slice(&wire::encode(&second).unwrap());

    let mut demux = Demultiplexer::new(Catalog::default());
    demux.append(&stream);

    assert_eq!(demux.read_next().unwrap(), Some(first));
    assert_eq!(demux.read_next().unwrap(), Some(second));
    assert_eq!(demux.read_next().unwrap(), None);

    let stats = demux.stats();
    assert_eq!(stats.corrupted_messages, 1);
    assert_eq!(stats.messages_decoded, 2);
    assert!(demux.has_corrupt_data());
}

#[test]
fn test_fatal_header_leaves_buffer_in_place() {
    let mut bytes = wire::encode(&Message::new(SessionClosed {
        session_id: Uuid::new_v4(),
    }))
    .unwrap();
    bytes[12..16].copy_from_slice(&i32::MAX.to_le_bytes());

    let mut demux = Demultiplexer::new(Catalog::default());
    demux.append(&bytes[..HEADER_SIZE]);

    for _ in 0..2 {
        assert!(matches!(
            demux.read_next(),
            Err(WireProtocolError::MessageTooLarge { .. })
        ));
    }
    assert_eq!(demux.buffered(), HEADER_SIZE);
}

#[test]
fn test_packet_stream_inside_message_stream() {
    let session_id = Uuid::new_v4();
    let start = Message::new(PacketStreamStart { session_id });
    let closed = Message::new(SessionClosed { session_id });
    let packets: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![0xAB; 5000], vec![42]];

    let mut stream = wire::encode(&start).unwrap();
    for packet in &packets {
        wire::encode_packet(packet, &mut stream).unwrap();
    }
    wire::encode_packet_stream_end(&mut stream);
    wire::encode_into(&closed, &mut stream).unwrap();

    let mut demux = Demultiplexer::new(Catalog::default());
    let mut received_packets = Vec::new();
    let mut messages = Vec::new();
    let mut in_packet_stream = false;

    for chunk in stream.chunks(9) {
        demux.append(chunk);
        loop {
            if in_packet_stream {
                match demux.read_next_packet().unwrap() {
                    Some(PacketFrame::Packet(packet)) => received_packets.push(packet),
                    Some(PacketFrame::EndOfStream) => in_packet_stream = false,
                    None => break,
                }
            } else {
                match demux.read_next().unwrap() {
                    Some(message) => {
                        in_packet_stream = message == start;
                        messages.push(message);
                    }
                    None => break,
                }
            }
        }
    }

    assert_eq!(messages, vec![start, closed]);
    assert_eq!(received_packets, packets);
    assert_eq!(demux.stats().packets_decoded, 3);
}

#[test]
fn test_long_streams_reclaim_consumed_bytes() {
    let message = Message::new(session_header(Uuid::new_v4()));
    let frame = wire::encode(&message).unwrap();
    let mut demux = Demultiplexer::new(Catalog::default());

    // One frame always stays pending so the buffer is never simply cleared
    demux.append(&frame);
    let rounds = (RECLAIM_THRESHOLD / frame.len()) * 4;
    for _ in 0..rounds {
        demux.append(&frame);
        assert_eq!(demux.read_next().unwrap(), Some(message.clone()));
        let consumed_prefix = demux.capacity_in_use() - demux.buffered();
        assert!(consumed_prefix <= RECLAIM_THRESHOLD);
    }

    assert_eq!(demux.buffered(), frame.len());
    assert_eq!(demux.stats().messages_decoded, rounds as u64);
}
