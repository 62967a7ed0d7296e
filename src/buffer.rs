//! Elastic receive buffer shared between the producer and consumer loops.
//!
//! Uses `bytes::BytesMut` for the backing storage. The producer appends
//! socket reads with [`ElasticBuffer::write`]; the consumer awaits and
//! consumes protocol units with [`ElasticBuffer::read_exact`] and
//! [`ElasticBuffer::peek`]. Capacity grows on demand up to a configured
//! maximum; exceeding the maximum is a hard `BufferExhausted` failure, never
//! a silent drop.
//!
//! # Contract
//!
//! Single writer, single reader. The buffer serializes cursor updates
//! internally, so neither side needs an external lock. A reader blocked on
//! insufficient data is woken by the next write; a writer blocked on the
//! backpressure threshold is woken when the reader drains below it.

use std::sync::Mutex;

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

use crate::error::{ChunkwireError, Result};

struct Inner {
    buf: BytesMut,
    closed: bool,
}

/// Append-only, consumable byte buffer with asynchronous reads and
/// threshold-gated write backpressure.
pub struct ElasticBuffer {
    inner: Mutex<Inner>,
    /// Signaled when bytes are appended or the buffer closes.
    readable: Notify,
    /// Signaled when the reader drains below the resume threshold.
    writable: Notify,
    max: usize,
    resume_threshold: usize,
}

impl ElasticBuffer {
    /// Create a buffer with the given initial capacity and hard maximum.
    pub fn new(initial: usize, max: usize, resume_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: BytesMut::with_capacity(initial),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            max,
            resume_threshold,
        }
    }

    /// Append bytes, waking a blocked reader.
    ///
    /// Suspends while the buffered byte count exceeds the resume threshold,
    /// resuming once the reader has drained below it. Fails with
    /// `BufferExhausted` if the unread bytes plus `data` would exceed the
    /// configured maximum.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        loop {
            {
                let mut inner = self.inner.lock().expect("buffer lock poisoned");
                if inner.closed {
                    return Err(ChunkwireError::ConnectionClosed);
                }
                let needed = inner.buf.len() + data.len();
                if needed > self.max {
                    return Err(ChunkwireError::BufferExhausted {
                        needed,
                        max: self.max,
                    });
                }
                if inner.buf.len() <= self.resume_threshold {
                    inner.buf.extend_from_slice(data);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            self.writable.notified().await;
        }
    }

    /// Consume exactly `n` bytes, suspending until they are available.
    ///
    /// Returns a view of the buffer region (`split_to().freeze()`), not a
    /// fresh allocation.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
        loop {
            {
                let mut inner = self.inner.lock().expect("buffer lock poisoned");
                if inner.buf.len() >= n {
                    let out = inner.buf.split_to(n).freeze();
                    if inner.buf.len() <= self.resume_threshold {
                        self.writable.notify_one();
                    }
                    return Ok(out);
                }
                if inner.closed {
                    return Err(ChunkwireError::ConnectionClosed);
                }
            }
            self.readable.notified().await;
        }
    }

    /// Wait until `n` bytes are available and return a copy without
    /// consuming them.
    ///
    /// Needed because chunk basic headers are variable-length: the number of
    /// bytes a handler must consume is only known after inspecting the first
    /// byte.
    pub async fn peek(&self, n: usize) -> Result<Bytes> {
        loop {
            {
                let inner = self.inner.lock().expect("buffer lock poisoned");
                if inner.buf.len() >= n {
                    return Ok(Bytes::copy_from_slice(&inner.buf[..n]));
                }
                if inner.closed {
                    return Err(ChunkwireError::ConnectionClosed);
                }
            }
            self.readable.notified().await;
        }
    }

    /// Discard `n` already-buffered bytes (after a successful `peek`).
    pub fn consume(&self, n: usize) -> Result<()> {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        if inner.buf.len() < n {
            return Err(ChunkwireError::Protocol(format!(
                "consume of {} bytes exceeds {} buffered",
                n,
                inner.buf.len()
            )));
        }
        let _ = inner.buf.split_to(n);
        if inner.buf.len() <= self.resume_threshold {
            self.writable.notify_one();
        }
        Ok(())
    }

    /// Number of unread bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").buf.len()
    }

    /// Check whether the buffer has no unread bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the buffer closed and wake both sides.
    ///
    /// Blocked and future reads that cannot be satisfied from the remaining
    /// bytes fail with `ConnectionClosed`. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("buffer lock poisoned");
        inner.closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn buffer() -> ElasticBuffer {
        ElasticBuffer::new(64, 1024, 512)
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let buf = buffer();
        buf.write(b"hello").await.unwrap();
        let out = buf.read_exact(5).await.unwrap();
        assert_eq!(&out[..], b"hello");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_read_waits_for_writer() {
        let buf = Arc::new(buffer());
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.read_exact(4).await })
        };

        // Partial data does not satisfy the read.
        buf.write(b"ab").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        buf.write(b"cd").await.unwrap();
        let out = reader.await.unwrap().unwrap();
        assert_eq!(&out[..], b"abcd");
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let buf = buffer();
        buf.write(b"xyz").await.unwrap();

        let peeked = buf.peek(1).await.unwrap();
        assert_eq!(&peeked[..], b"x");
        assert_eq!(buf.len(), 3);

        let out = buf.read_exact(3).await.unwrap();
        assert_eq!(&out[..], b"xyz");
    }

    #[tokio::test]
    async fn test_consume_after_peek() {
        let buf = buffer();
        buf.write(b"abcdef").await.unwrap();

        buf.peek(2).await.unwrap();
        buf.consume(2).unwrap();
        let out = buf.read_exact(4).await.unwrap();
        assert_eq!(&out[..], b"cdef");
    }

    #[tokio::test]
    async fn test_consume_more_than_buffered_fails() {
        let buf = buffer();
        buf.write(b"ab").await.unwrap();
        assert!(matches!(
            buf.consume(3),
            Err(ChunkwireError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let buf = ElasticBuffer::new(8, 16, 512);
        buf.write(&[0u8; 16]).await.unwrap();

        let result = buf.write(&[0u8; 1]).await;
        assert!(matches!(
            result,
            Err(ChunkwireError::BufferExhausted { needed: 17, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_backpressure_throttles_writer() {
        // Threshold of 4: a second write must wait until the reader drains.
        let buf = Arc::new(ElasticBuffer::new(8, 1024, 4));
        buf.write(b"abcdef").await.unwrap();

        let writer = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.write(b"gh").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!writer.is_finished());

        let out = buf.read_exact(6).await.unwrap();
        assert_eq!(&out[..], b"abcdef");
        writer.await.unwrap().unwrap();
        assert_eq!(buf.len(), 2);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let buf = Arc::new(buffer());
        let reader = {
            let buf = buf.clone();
            tokio::spawn(async move { buf.read_exact(1).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        buf.close();
        let result = reader.await.unwrap();
        assert!(matches!(result, Err(ChunkwireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_remaining_bytes_readable_after_close() {
        let buf = buffer();
        buf.write(b"tail").await.unwrap();
        buf.close();

        // Bytes already buffered stay readable.
        let out = buf.read_exact(4).await.unwrap();
        assert_eq!(&out[..], b"tail");

        // Further reads fail.
        assert!(matches!(
            buf.read_exact(1).await,
            Err(ChunkwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let buf = buffer();
        buf.close();
        assert!(matches!(
            buf.write(b"x").await,
            Err(ChunkwireError::ConnectionClosed)
        ));
    }
}
