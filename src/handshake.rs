//! RTMP server-side handshake (C0/C1 → S0/S1/S2 → C2).
//!
//! The handshake runs as the first phase of the consumer loop: each call to
//! [`HandshakeContext::advance`] consumes exactly the bytes of the current
//! stage from the shared receive buffer, suspending until they are all
//! available, and replies through the write queue. Only the simple
//! (non-digest) handshake is implemented; C2 is accepted without strict
//! validation, matching the reference server.

use bytes::{BufMut, Bytes, BytesMut};

use crate::buffer::ElasticBuffer;
use crate::error::{ChunkwireError, Result};
use crate::writer::WriterHandle;

/// Size of the C1/S1/C2/S2 handshake blocks.
pub const HANDSHAKE_SIZE: usize = 1536;

/// Protocol version carried in C0/S0.
pub const RTMP_VERSION: u8 = 3;

/// Handshake stage. Stages advance monotonically; no stage is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Awaiting the version byte plus the full C1 block.
    C0C1,
    /// S0/S1/S2 sent, awaiting the C2 echo.
    C2,
}

/// Outcome of one handshake step.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// More stages remain.
    InProgress,
    /// The byte exchange is done; chunk streaming may begin.
    Complete,
}

/// State of an in-flight handshake.
pub struct HandshakeContext {
    stage: HandshakeStage,
    writer: WriterHandle,
}

impl HandshakeContext {
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            stage: HandshakeStage::C0C1,
            writer,
        }
    }

    /// Current stage, for observability.
    pub fn stage(&self) -> HandshakeStage {
        self.stage
    }

    /// Run the handler for the current stage against the shared buffer.
    ///
    /// Suspends until the stage's full byte count is buffered. A bad version
    /// byte is fatal. Returns `Complete` exactly once, after C2 has been
    /// consumed.
    pub async fn advance(&mut self, buffer: &ElasticBuffer) -> Result<HandshakeProgress> {
        match self.stage {
            HandshakeStage::C0C1 => {
                let c0c1 = buffer.read_exact(1 + HANDSHAKE_SIZE).await?;
                let version = c0c1[0];
                if version != RTMP_VERSION {
                    return Err(ChunkwireError::Handshake(format!(
                        "unsupported protocol version {version}"
                    )));
                }
                let c1 = c0c1.slice(1..);

                let response = build_s0s1s2(&c1);
                // Flush completion is observed by the writer loop; the
                // consumer moves on to await C2.
                let _receipt = self.writer.send(response).await?;

                tracing::debug!("C0/C1 accepted, S0/S1/S2 queued");
                self.stage = HandshakeStage::C2;
                Ok(HandshakeProgress::InProgress)
            }
            HandshakeStage::C2 => {
                // C2 is not validated strictly.
                let _c2 = buffer.read_exact(HANDSHAKE_SIZE).await?;
                tracing::debug!("C2 received, handshake complete");
                Ok(HandshakeProgress::Complete)
            }
        }
    }
}

/// Build the S0+S1+S2 reply: version byte, then S1 (timestamp, zero, random
/// fill), then S2 echoing C1.
fn build_s0s1s2(c1: &Bytes) -> Bytes {
    let mut response = BytesMut::with_capacity(1 + HANDSHAKE_SIZE * 2);
    response.put_u8(RTMP_VERSION);
    // S1
    response.put_u32(0); // timestamp
    response.put_u32(0); // zero
    let mut state = seed();
    for _ in 0..(HANDSHAKE_SIZE - 8) {
        state = next(state);
        response.put_u8(state as u8);
    }
    // S2
    response.extend_from_slice(c1);
    response.freeze()
}

/// Simple time-seeded generator for the S1 random section. The handshake
/// does not require cryptographic randomness.
fn seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos.wrapping_mul(0x517cc1b727220a95) | 1
}

fn next(mut state: u64) -> u64 {
    state ^= state << 13;
    state ^= state >> 7;
    state ^= state << 17;
    state
}
