//! Error types for chunkwire.

use thiserror::Error;

/// Main error type for all chunkwire operations.
#[derive(Debug, Error)]
pub enum ChunkwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Receive buffer growth would exceed the configured maximum.
    #[error("receive buffer exhausted: {needed} bytes needed, maximum is {max}")]
    BufferExhausted { needed: usize, max: usize },

    /// Protocol error (malformed chunk header, bad control message, etc.).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake failed (wrong version, malformed C1/C2).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Message-level operation attempted before the handshake completed.
    #[error("handshake not yet complete")]
    HandshakeIncomplete,

    /// Connection closed while an operation was pending.
    #[error("connection closed")]
    ConnectionClosed,

    /// Backpressure timeout - write queue full.
    #[error("backpressure timeout")]
    BackpressureTimeout,
}

/// Result type alias using ChunkwireError.
pub type Result<T> = std::result::Result<T, ChunkwireError>;
