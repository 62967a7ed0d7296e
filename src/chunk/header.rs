//! Chunk header encoding and decoding.
//!
//! Wire layout per chunk:
//! ```text
//! ┌──────────────┬────────────────────┬─────────────────────┐
//! │ Basic header │ Message header     │ Extended timestamp  │
//! │ 1-3 bytes    │ 0/3/7/11 bytes     │ 0 or 4 bytes        │
//! └──────────────┴────────────────────┴─────────────────────┘
//! ```
//! The basic header carries the format (fmt 0-3) and the chunk stream id;
//! the message header size depends on fmt. Timestamps ≥ `0xFFFFFF` overflow
//! into the extended timestamp field.

use bytes::{BufMut, BytesMut};

use crate::error::{ChunkwireError, Result};

/// Timestamp sentinel indicating an extended timestamp follows.
pub const EXTENDED_TIMESTAMP_MARKER: u32 = 0xFF_FFFF;

/// Default chunk payload size until a SetChunkSize arrives.
pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// Upper bound accepted for a peer-announced chunk size.
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Decoded basic header: chunk format plus chunk stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicHeader {
    pub fmt: u8,
    pub csid: u32,
}

impl BasicHeader {
    /// Total encoded length implied by the first byte (1, 2 or 3 bytes).
    pub fn encoded_len(first_byte: u8) -> usize {
        match first_byte & 0x3F {
            0 => 2,
            1 => 3,
            _ => 1,
        }
    }

    /// Decode from exactly the bytes `encoded_len` asked for.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let first = *bytes.first().ok_or_else(|| {
            ChunkwireError::Protocol("empty basic header".to_string())
        })?;
        let fmt = (first >> 6) & 0x03;
        let csid = match first & 0x3F {
            0 => {
                let b = *bytes.get(1).ok_or_else(short)?;
                b as u32 + 64
            }
            1 => {
                let b1 = *bytes.get(1).ok_or_else(short)? as u32;
                let b2 = *bytes.get(2).ok_or_else(short)? as u32;
                b2 * 256 + b1 + 64
            }
            small => small as u32,
        };
        Ok(Self { fmt, csid })
    }

    /// Append the encoded form to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        let fmt_bits = (self.fmt & 0x03) << 6;
        match self.csid {
            csid @ 2..=63 => out.put_u8(fmt_bits | csid as u8),
            csid @ 64..=319 => {
                out.put_u8(fmt_bits);
                out.put_u8((csid - 64) as u8);
            }
            csid => {
                out.put_u8(fmt_bits | 1);
                let rest = csid - 64;
                out.put_u8((rest % 256) as u8);
                out.put_u8((rest / 256) as u8);
            }
        }
    }
}

fn short() -> ChunkwireError {
    ChunkwireError::Protocol("truncated basic header".to_string())
}

/// Size of the message header for a given chunk format.
pub fn message_header_len(fmt: u8) -> usize {
    match fmt {
        0 => 11,
        1 => 7,
        2 => 3,
        _ => 0,
    }
}

/// Message header fields cached per chunk stream, updated by each fmt 0-2
/// header and reused verbatim by fmt 3 continuations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageHeaderFields {
    pub timestamp: u32,
    pub timestamp_delta: u32,
    pub message_length: usize,
    pub type_id: u8,
    pub stream_id: u32,
    /// The 24-bit timestamp field held the overflow marker; a 4-byte
    /// extended timestamp follows the current header.
    pub extended: bool,
    /// The cached fmt 0-2 header overflowed, so fmt 3 chunks on this
    /// stream repeat the 4-byte extended timestamp field.
    pub uses_extended: bool,
}

impl MessageHeaderFields {
    /// Fold a decoded fmt 0-3 message header into the cached fields.
    ///
    /// `bytes` must be exactly `message_header_len(fmt)` long. For fmt 1-3
    /// the missing fields are inherited from the previous header on the same
    /// chunk stream, per the chunking rules.
    pub fn apply(&mut self, fmt: u8, bytes: &[u8]) -> Result<()> {
        if bytes.len() != message_header_len(fmt) {
            return Err(ChunkwireError::Protocol(format!(
                "message header for fmt {} must be {} bytes, got {}",
                fmt,
                message_header_len(fmt),
                bytes.len()
            )));
        }
        match fmt {
            0 => {
                let ts = be24(&bytes[0..3]);
                self.message_length = be24(&bytes[3..6]) as usize;
                self.type_id = bytes[6];
                self.stream_id =
                    u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]);
                self.timestamp_delta = 0;
                self.extended = ts == EXTENDED_TIMESTAMP_MARKER;
                self.uses_extended = self.extended;
                if !self.extended {
                    self.timestamp = ts;
                }
            }
            1 => {
                let delta = be24(&bytes[0..3]);
                self.message_length = be24(&bytes[3..6]) as usize;
                self.type_id = bytes[6];
                self.extended = delta == EXTENDED_TIMESTAMP_MARKER;
                self.uses_extended = self.extended;
                if !self.extended {
                    self.timestamp_delta = delta;
                    self.timestamp = self.timestamp.wrapping_add(delta);
                }
            }
            2 => {
                let delta = be24(&bytes[0..3]);
                self.extended = delta == EXTENDED_TIMESTAMP_MARKER;
                self.uses_extended = self.extended;
                if !self.extended {
                    self.timestamp_delta = delta;
                    self.timestamp = self.timestamp.wrapping_add(delta);
                }
            }
            3 => {
                // Everything inherited. A chunk stream whose cached header
                // overflowed repeats the extended timestamp on every fmt 3
                // chunk.
                self.extended = self.uses_extended;
            }
            other => {
                return Err(ChunkwireError::Protocol(format!(
                    "invalid chunk format {other}"
                )));
            }
        }
        Ok(())
    }

    /// Fold in the 4-byte extended timestamp that followed the header.
    pub fn apply_extended_timestamp(&mut self, fmt: u8, value: u32) {
        match fmt {
            0 => self.timestamp = value,
            1 | 2 => {
                self.timestamp_delta = value;
                self.timestamp = self.timestamp.wrapping_add(value);
            }
            // fmt 3 repeats a field already applied; consume it without
            // re-adding the delta.
            _ => {}
        }
        self.extended = false;
    }
}

/// Encode a full type-0 header (basic + message header + extended timestamp
/// if required) for an outbound message.
pub fn encode_type0_header(
    out: &mut BytesMut,
    csid: u32,
    timestamp: u32,
    message_length: usize,
    type_id: u8,
    stream_id: u32,
) {
    BasicHeader { fmt: 0, csid }.encode(out);
    let (field, extended) = if timestamp >= EXTENDED_TIMESTAMP_MARKER {
        (EXTENDED_TIMESTAMP_MARKER, true)
    } else {
        (timestamp, false)
    };
    put_be24(out, field);
    put_be24(out, message_length as u32);
    out.put_u8(type_id);
    out.put_u32_le(stream_id);
    if extended {
        out.put_u32(timestamp);
    }
}

fn be24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn put_be24(out: &mut BytesMut, value: u32) {
    out.put_u8((value >> 16) as u8);
    out.put_u8((value >> 8) as u8);
    out.put_u8(value as u8);
}
