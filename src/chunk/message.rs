//! Whole protocol messages carried by the chunk stream.
//!
//! Payloads stay opaque `Bytes`; AMF command bodies are decoded by the
//! session layer above this crate.

use bytes::{BufMut, Bytes, BytesMut};

/// RTMP message type ids this layer knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    SetChunkSize,        // type 1
    AbortMessage,        // type 2
    Acknowledgement,     // type 3
    UserControl,         // type 4
    WindowAckSize,       // type 5
    SetPeerBandwidth,    // type 6
    Audio,               // type 8
    Video,               // type 9
    Amf3Command,         // type 17
    Amf0Command,         // type 20
    Unknown(u8),
}

impl From<u8> for MessageType {
    fn from(val: u8) -> Self {
        match val {
            1 => MessageType::SetChunkSize,
            2 => MessageType::AbortMessage,
            3 => MessageType::Acknowledgement,
            4 => MessageType::UserControl,
            5 => MessageType::WindowAckSize,
            6 => MessageType::SetPeerBandwidth,
            8 => MessageType::Audio,
            9 => MessageType::Video,
            17 => MessageType::Amf3Command,
            20 => MessageType::Amf0Command,
            other => MessageType::Unknown(other),
        }
    }
}

impl MessageType {
    /// Wire type id.
    pub fn type_id(&self) -> u8 {
        match *self {
            MessageType::SetChunkSize => 1,
            MessageType::AbortMessage => 2,
            MessageType::Acknowledgement => 3,
            MessageType::UserControl => 4,
            MessageType::WindowAckSize => 5,
            MessageType::SetPeerBandwidth => 6,
            MessageType::Audio => 8,
            MessageType::Video => 9,
            MessageType::Amf3Command => 17,
            MessageType::Amf0Command => 20,
            MessageType::Unknown(other) => other,
        }
    }
}

/// A reassembled (inbound) or to-be-chunked (outbound) message.
#[derive(Debug, Clone)]
pub struct Message {
    pub message_type: MessageType,
    pub timestamp: u32,
    /// Message stream id the message belongs to.
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Message {
    pub fn new(message_type: MessageType, timestamp: u32, stream_id: u32, payload: Bytes) -> Self {
        Self {
            message_type,
            timestamp,
            stream_id,
            payload,
        }
    }

    /// Acknowledgement (type 3) carrying the received-byte sequence number.
    pub fn acknowledgement(sequence_number: u32) -> Self {
        Self::new(
            MessageType::Acknowledgement,
            0,
            0,
            u32_payload(sequence_number),
        )
    }

    /// Window Acknowledgement Size (type 5).
    pub fn window_ack_size(window: u32) -> Self {
        Self::new(MessageType::WindowAckSize, 0, 0, u32_payload(window))
    }

    /// Set Chunk Size (type 1).
    pub fn set_chunk_size(size: u32) -> Self {
        Self::new(MessageType::SetChunkSize, 0, 0, u32_payload(size))
    }
}

fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(value);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_id_roundtrip() {
        for id in [1u8, 2, 3, 4, 5, 6, 8, 9, 17, 20, 42] {
            assert_eq!(MessageType::from(id).type_id(), id);
        }
    }

    #[test]
    fn test_unknown_type_preserved() {
        assert_eq!(MessageType::from(99), MessageType::Unknown(99));
    }

    #[test]
    fn test_acknowledgement_payload_is_big_endian() {
        let msg = Message::acknowledgement(0x01020304);
        assert_eq!(msg.message_type, MessageType::Acknowledgement);
        assert_eq!(&msg.payload[..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_control_constructors() {
        assert_eq!(
            Message::window_ack_size(2_500_000).message_type,
            MessageType::WindowAckSize
        );
        assert_eq!(
            Message::set_chunk_size(4096).message_type,
            MessageType::SetChunkSize
        );
    }
}
