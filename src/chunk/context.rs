//! Chunk stream context: demultiplexing, reassembly, flow-control
//! accounting and outbound multiplexing.
//!
//! Installed by the pipeline when the handshake completes; from then on it
//! owns all state progression for inbound bytes. The demux side is a state
//! machine advanced one step per [`ChunkStreamContext::process`] call,
//! suspending on the shared buffer whenever a step's bytes are not fully
//! available. Reassembled messages are forwarded to the session layer over
//! an mpsc channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};

use super::header::{
    encode_type0_header, message_header_len, BasicHeader, MessageHeaderFields,
    DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE,
};
use super::message::{Message, MessageType};
use crate::buffer::ElasticBuffer;
use crate::error::{ChunkwireError, Result};
use crate::writer::{WriteReceipt, WriterHandle};

/// Chunk stream id used for protocol control messages.
const CONTROL_CSID: u32 = 2;

/// Demux phase. Exactly one is active; transitions happen only when the
/// current phase's handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Awaiting the first byte of a basic header to learn its length.
    FirstByteBasicHeader,
    /// Basic header read; awaiting the fmt-sized message header.
    ChunkMessageHeader,
    /// Message header carried the overflow marker; awaiting 4 more bytes.
    ExtendedTimestamp,
    /// Awaiting the chunk's payload slice of the current message.
    CompleteMessage,
}

#[derive(Default)]
struct StreamState {
    fields: MessageHeaderFields,
    partial: BytesMut,
}

struct DemuxState {
    state: ChunkState,
    /// Inbound chunk payload size, updated by SetChunkSize.
    chunk_size: usize,
    streams: HashMap<u32, StreamState>,
    current_csid: u32,
    current_fmt: u8,
}

/// Per-connection chunk stream collaborator.
pub struct ChunkStreamContext {
    writer: WriterHandle,
    messages: mpsc::Sender<Message>,
    demux: Mutex<DemuxState>,
    /// Bytes received since the last acknowledgement.
    read_window_size: AtomicU32,
    /// Acknowledgement threshold negotiated with the peer; 0 = unset.
    window_ack_size: AtomicU32,
    /// Running total of bytes received, used as the ack sequence number.
    total_received: AtomicU64,
    /// Outbound chunk payload size.
    out_chunk_size: AtomicUsize,
}

impl ChunkStreamContext {
    pub fn new(writer: WriterHandle, messages: mpsc::Sender<Message>) -> Self {
        Self {
            writer,
            messages,
            demux: Mutex::new(DemuxState {
                state: ChunkState::FirstByteBasicHeader,
                chunk_size: DEFAULT_CHUNK_SIZE,
                streams: HashMap::new(),
                current_csid: 0,
                current_fmt: 0,
            }),
            read_window_size: AtomicU32::new(0),
            window_ack_size: AtomicU32::new(0),
            total_received: AtomicU64::new(0),
            out_chunk_size: AtomicUsize::new(DEFAULT_CHUNK_SIZE),
        }
    }

    // ------------------------------------------------------------------
    // Demultiplexing
    // ------------------------------------------------------------------

    /// Advance the demux state machine by one step against the shared
    /// buffer, suspending until the step's bytes are available.
    pub async fn process(&self, buffer: &ElasticBuffer) -> Result<()> {
        let mut d = self.demux.lock().await;
        match d.state {
            ChunkState::FirstByteBasicHeader => {
                let first = buffer.peek(1).await?;
                let need = BasicHeader::encoded_len(first[0]);
                let bytes = buffer.read_exact(need).await?;
                let basic = BasicHeader::decode(&bytes)?;
                d.current_csid = basic.csid;
                d.current_fmt = basic.fmt;
                d.state = ChunkState::ChunkMessageHeader;
            }
            ChunkState::ChunkMessageHeader => {
                let need = message_header_len(d.current_fmt);
                let bytes = if need > 0 {
                    buffer.read_exact(need).await?
                } else {
                    Bytes::new()
                };
                let csid = d.current_csid;
                let fmt = d.current_fmt;
                let extended = {
                    let stream = d.streams.entry(csid).or_default();
                    stream.fields.apply(fmt, &bytes)?;
                    stream.fields.extended
                };
                d.state = if extended {
                    ChunkState::ExtendedTimestamp
                } else {
                    ChunkState::CompleteMessage
                };
            }
            ChunkState::ExtendedTimestamp => {
                let bytes = buffer.read_exact(4).await?;
                let value = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let csid = d.current_csid;
                let fmt = d.current_fmt;
                let stream = d.streams.entry(csid).or_default();
                stream.fields.apply_extended_timestamp(fmt, value);
                d.state = ChunkState::CompleteMessage;
            }
            ChunkState::CompleteMessage => {
                let csid = d.current_csid;
                let chunk_size = d.chunk_size;
                let (total, buffered) = {
                    let stream = d.streams.entry(csid).or_default();
                    (stream.fields.message_length, stream.partial.len())
                };
                let take = total.saturating_sub(buffered).min(chunk_size);
                let payload = if take > 0 {
                    Some(buffer.read_exact(take).await?)
                } else {
                    None
                };

                d.state = ChunkState::FirstByteBasicHeader;
                let stream = d.streams.entry(csid).or_default();
                if let Some(payload) = payload {
                    stream.partial.extend_from_slice(&payload);
                }
                if stream.partial.len() >= total {
                    let message = Message::new(
                        MessageType::from(stream.fields.type_id),
                        stream.fields.timestamp,
                        stream.fields.stream_id,
                        stream.partial.split().freeze(),
                    );
                    self.dispatch(&mut d, message).await?;
                }
            }
        }
        Ok(())
    }

    /// Apply protocol control messages locally; forward the rest to the
    /// session layer.
    async fn dispatch(&self, d: &mut DemuxState, message: Message) -> Result<()> {
        match message.message_type {
            MessageType::SetChunkSize => {
                let size = control_u32(&message)? as usize;
                if size == 0 {
                    return Err(ChunkwireError::Protocol(
                        "peer announced zero chunk size".to_string(),
                    ));
                }
                let clamped = size.min(MAX_CHUNK_SIZE);
                if clamped != size {
                    tracing::warn!(size, max = MAX_CHUNK_SIZE, "clamping peer chunk size");
                }
                tracing::debug!(chunk_size = clamped, "inbound chunk size updated");
                d.chunk_size = clamped;
            }
            MessageType::WindowAckSize => {
                let window = control_u32(&message)?;
                tracing::debug!(window, "peer set acknowledgement window");
                self.window_ack_size.store(window, Ordering::Release);
            }
            MessageType::Acknowledgement => {
                tracing::trace!("peer acknowledgement received");
            }
            _ => {
                self.messages
                    .send(message)
                    .await
                    .map_err(|_| ChunkwireError::ConnectionClosed)?;
            }
        }
        Ok(())
    }

    /// Current demux phase, for observability and tests.
    pub async fn state(&self) -> ChunkState {
        self.demux.lock().await.state
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    /// Record `n` freshly received bytes, emitting one acknowledgement per
    /// threshold crossing. Called by the producer loop after every socket
    /// read; the counter is decremented by exactly the threshold, never
    /// reset, so surplus bytes keep counting toward the next window.
    pub async fn record_inbound(&self, n: usize) -> Result<()> {
        self.total_received.fetch_add(n as u64, Ordering::AcqRel);
        let mut window = self
            .read_window_size
            .load(Ordering::Acquire)
            .wrapping_add(n as u32);

        let threshold = self.window_ack_size.load(Ordering::Acquire);
        if threshold > 0 {
            while window >= threshold {
                self.acknowledgement(threshold).await?;
                window -= threshold;
            }
        }
        self.read_window_size.store(window, Ordering::Release);
        Ok(())
    }

    /// Emit an acknowledgement message carrying the running received-byte
    /// sequence number.
    pub async fn acknowledgement(&self, threshold: u32) -> Result<()> {
        let sequence = self.total_received.load(Ordering::Acquire) as u32;
        tracing::debug!(sequence, threshold, "emitting acknowledgement");
        let _receipt = self
            .multiplex_message(CONTROL_CSID, Message::acknowledgement(sequence))
            .await?;
        Ok(())
    }

    /// Bytes received since the last acknowledgement.
    pub fn read_window_size(&self) -> u32 {
        self.read_window_size.load(Ordering::Acquire)
    }

    /// Acknowledgement threshold, if the peer negotiated one.
    pub fn window_acknowledgement_size(&self) -> Option<u32> {
        match self.window_ack_size.load(Ordering::Acquire) {
            0 => None,
            window => Some(window),
        }
    }

    /// Set the acknowledgement threshold (normally driven by the peer's
    /// WindowAckSize message).
    pub fn set_window_acknowledgement_size(&self, window: u32) {
        self.window_ack_size.store(window, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Multiplexing
    // ------------------------------------------------------------------

    /// Chunk an outbound message onto `csid` and enqueue it as a single
    /// block: a type-0 header, then type-3 continuations at the outbound
    /// chunk size. Per-call bytes are never interleaved with other sends.
    pub async fn multiplex_message(&self, csid: u32, message: Message) -> Result<WriteReceipt> {
        let chunk_size = self.out_chunk_size.load(Ordering::Acquire);
        let payload = &message.payload;
        let mut out = BytesMut::with_capacity(payload.len() + 18 + payload.len() / chunk_size * 3);

        encode_type0_header(
            &mut out,
            csid,
            message.timestamp,
            payload.len(),
            message.message_type.type_id(),
            message.stream_id,
        );
        let mut offset = 0;
        while offset < payload.len() {
            if offset > 0 {
                BasicHeader { fmt: 3, csid }.encode(&mut out);
            }
            let take = chunk_size.min(payload.len() - offset);
            out.extend_from_slice(&payload[offset..offset + take]);
            offset += take;
        }

        self.writer.send(out.freeze()).await
    }

    /// Update the outbound chunk size (callers should announce the change
    /// to the peer with a SetChunkSize message first).
    pub fn set_outbound_chunk_size(&self, size: usize) {
        self.out_chunk_size
            .store(size.clamp(1, MAX_CHUNK_SIZE), Ordering::Release);
    }
}

fn control_u32(message: &Message) -> Result<u32> {
    if message.payload.len() < 4 {
        return Err(ChunkwireError::Protocol(format!(
            "control message {:?} payload too short",
            message.message_type
        )));
    }
    let p = &message.payload;
    Ok(u32::from_be_bytes([p[0], p[1], p[2], p[3]]))
}
