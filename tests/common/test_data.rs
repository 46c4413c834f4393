//! Helper functions for creating test data

use sessionlink::messages::types::{
    ClockDrift, LiveViewStart, LiveViewStop, Message, PacketStreamStart, Payload, ProtocolVersion,
    RegisterAgent, RegisterAnalyst, SendSession, SessionClosed, SessionCriteria, SessionHeader,
    SessionStatus,
};
use sessionlink::messages::wire;
use uuid::Uuid;

pub fn session_header(session_id: Uuid) -> SessionHeader {
    SessionHeader {
        session_id,
        product: "Telemetry Demo".to_string(),
        application: "checkout-service".to_string(),
        host_name: "build-agent-07".to_string(),
        started_at: 1_700_000_000_000_000,
        ended_at: None,
        status: SessionStatus::Running,
    }
}

/// One message of every registered kind with ordinary field values
pub fn sample_messages() -> Vec<Message> {
    let session_id = Uuid::new_v4();
    vec![
        Message::new(LiveViewStart::new(Uuid::new_v4(), session_id, Uuid::new_v4(), 0)),
        Message::new(LiveViewStop {
            session_id,
            channel_id: Uuid::new_v4(),
        }),
        Message::new(SendSession {
            session_id,
            criteria: SessionCriteria::ACTIVE | SessionCriteria::ERROR,
        }),
        Message::new(session_header(session_id)),
        Message::new(Payload::GetSessionHeaders),
        Message::new(RegisterAgent { session_id }),
        Message::new(RegisterAnalyst {
            client_id: Uuid::new_v4(),
            user_name: "analyst".to_string(),
        }),
        Message::new(SessionClosed { session_id }),
        Message::new(PacketStreamStart { session_id }),
        Message::new(ClockDrift::at(1_700_000_000_123_456)),
        Message::new(Payload::PauseSessionHeaders),
        Message::new(Payload::ResumeSessionHeaders),
    ]
}

/// Messages carrying edge-of-range field values
pub fn boundary_messages() -> Vec<Message> {
    let long_text = "x".repeat(64 * 1024);
    let max_id = Uuid::from_u128(u128::MAX);
    vec![
        Message::new(LiveViewStart::new(Uuid::nil(), max_id, max_id, i64::MAX)),
        Message::new(LiveViewStart::new(max_id, Uuid::new_v4(), Uuid::new_v4(), i64::MIN)),
        Message::new(SendSession {
            session_id: Uuid::nil(),
            criteria: SessionCriteria(u32::MAX),
        }),
        Message::new(SessionHeader {
            session_id: Uuid::nil(),
            product: String::new(),
            application: long_text.clone(),
            host_name: "ホスト名".to_string(),
            started_at: 0,
            ended_at: Some(-1),
            status: SessionStatus::Crashed,
        }),
        Message::new(SessionHeader {
            started_at: i64::MIN,
            ended_at: Some(i64::MAX),
            status: SessionStatus::Normal,
            ..session_header(max_id)
        }),
        Message::new(RegisterAnalyst {
            client_id: Uuid::nil(),
            user_name: long_text,
        }),
        Message::new(ClockDrift {
            id: Uuid::nil(),
            originator_timestamp: i64::MIN,
            destination_timestamp: Some(i64::MAX),
        }),
        Message::with_version(ProtocolVersion::V1_0, SessionClosed { session_id: max_id }),
    ]
}

/// Concatenate the wire encoding of every message
pub fn encode_all(messages: &[Message]) -> Vec<u8> {
    let mut bytes = Vec::new();
    for message in messages {
        wire::encode_into(message, &mut bytes).expect("Failed to encode test message");
    }
    bytes
}
