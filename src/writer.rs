//! Outbound write queue and the dedicated writer loop.
//!
//! All senders (handshake, chunk multiplexer, session layer) enqueue owned
//! byte blocks through a cloneable [`WriterHandle`]; a single long-running
//! [`writer_loop`] dequeues exactly one entry per wake-up and flushes it to
//! the socket. The mpsc channel provides the counting wake-up semantics: the
//! loop never misses an enqueue that happened before it started waiting.
//!
//! # Architecture
//!
//! ```text
//! Handshake   ─┐
//! Multiplexer ─┼─► mpsc::Sender<PendingWrite> ─► Writer Loop ─► Socket
//! Session     ─┘
//! ```
//!
//! # Guarantees
//!
//! - Strict FIFO: blocks are flushed in enqueue order, unsplit and
//!   uninterleaved per call.
//! - Each enqueue returns a [`WriteReceipt`] that resolves once the bytes
//!   have been flushed, or fails with the transport error.
//! - Every block is dropped exactly once, by the writer loop, on the single
//!   code path that completes the send.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{ChunkwireError, Result};

/// Interval between backpressure re-checks.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// An owned byte block awaiting its turn on the socket.
struct PendingWrite {
    data: Bytes,
    done: oneshot::Sender<Result<()>>,
}

/// Future resolving when an enqueued block has been flushed to the socket.
pub struct WriteReceipt {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for WriteReceipt {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Writer loop dropped the entry without completing it.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChunkwireError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle for enqueuing outbound blocks.
///
/// Cheaply cloneable; safe for concurrent enqueue while the single writer
/// loop dequeues.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<PendingWrite>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Enqueue `data` for sending, taking ownership of the block.
    ///
    /// Waits for backpressure to clear if the pending count is at its limit,
    /// timing out after the configured duration. The returned receipt
    /// resolves once the bytes reach the socket.
    pub async fn send(&self, data: Bytes) -> Result<WriteReceipt> {
        if self.pending.load(Ordering::Acquire) >= self.max_pending {
            self.wait_for_backpressure().await?;
        }
        self.pending.fetch_add(1, Ordering::AcqRel);

        let (done, rx) = oneshot::channel();
        self.tx
            .send(PendingWrite { data, done })
            .await
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::Release);
                ChunkwireError::ConnectionClosed
            })?;
        Ok(WriteReceipt { rx })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.pending.load(Ordering::Acquire) < self.max_pending {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(ChunkwireError::BackpressureTimeout);
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Number of blocks enqueued but not yet flushed.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Check if the writer loop is gone.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create the write queue, returning the enqueue handle and the receiver end
/// the writer loop drains.
pub(crate) fn write_queue(config: &ConnectionConfig) -> (WriterHandle, WriteQueueReceiver) {
    let (tx, rx) = mpsc::channel(config.writer_queue_capacity);
    let pending = Arc::new(AtomicUsize::new(0));
    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_writes,
        timeout: config.backpressure_timeout,
    };
    (handle, WriteQueueReceiver { rx, pending })
}

/// Receiver half of the write queue, consumed by [`writer_loop`].
pub(crate) struct WriteQueueReceiver {
    rx: mpsc::Receiver<PendingWrite>,
    pending: Arc<AtomicUsize>,
}

/// Long-running writer loop: one dequeue per wake, exact-length sends, FIFO.
///
/// Terminates normally when the queue closes or the cancellation token
/// fires; terminates with the transport error if a send faults, after
/// failing the in-flight receipt and every receipt still queued.
pub(crate) async fn writer_loop<W>(
    mut queue: WriteQueueReceiver,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let entry = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("writer loop cancelled");
                return Ok(());
            }
            entry = queue.rx.recv() => match entry {
                Some(entry) => entry,
                None => return Ok(()),
            },
        };

        let result = async {
            writer.write_all(&entry.data).await?;
            writer.flush().await?;
            std::io::Result::Ok(())
        }
        .await;

        queue.pending.fetch_sub(1, Ordering::Release);

        match result {
            Ok(()) => {
                let _ = entry.done.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!(error = %e, "socket send failed, terminating writer loop");
                let fault = std::io::Error::new(e.kind(), e.to_string());
                let _ = entry.done.send(Err(ChunkwireError::Io(e)));
                // Fail everything still queued so no receipt hangs.
                while let Ok(stale) = queue.rx.try_recv() {
                    queue.pending.fetch_sub(1, Ordering::Release);
                    let _ = stale.done.send(Err(ChunkwireError::ConnectionClosed));
                }
                return Err(ChunkwireError::Io(fault));
            }
        }
    }
}
