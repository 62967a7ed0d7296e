//! Per-connection I/O pipeline.
//!
//! Three cooperating loops run per connection:
//!
//! ```text
//! Socket ─► Producer ─► ElasticBuffer ─► Consumer ─► Session (messages)
//!                                          │
//!               Writer ◄─ write queue ◄────┴─ handshake / multiplexer
//! ```
//!
//! The producer moves raw socket bytes into the shared buffer and feeds the
//! acknowledgement accounting. The consumer interprets buffered bytes, first
//! as handshake stages, then as chunk stream state steps. The writer drains
//! the outbound queue. All three report into a result channel; the first
//! loop to finish triggers teardown of the others, and the first error
//! reported decides the pipeline's result.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::buffer::ElasticBuffer;
use crate::chunk::{ChunkStreamContext, Message};
use crate::config::ConnectionConfig;
use crate::error::{ChunkwireError, Result};
use crate::handshake::{HandshakeContext, HandshakeProgress};
use crate::pool::BufferPool;
use crate::writer::{write_queue, writer_loop, WriteQueueReceiver, WriteReceipt, WriterHandle};

/// Capacity of the reassembled-message channel handed to the session layer.
const MESSAGE_CHANNEL_CAPACITY: usize = 64;

/// How a pipeline run ended when no fault occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The peer closed the connection after the handshake; all loops wound
    /// down cleanly.
    Completed,
    /// Teardown was requested through [`ConnectionHandle::disconnect`] or an
    /// external cancellation.
    Cancelled,
}

/// Consumer interpretation phase. The handshake context is dropped at
/// handoff; only the chunk stream context survives into steady state.
enum Phase {
    Handshaking(HandshakeContext),
    Streaming(Arc<ChunkStreamContext>),
}

/// Cloneable handle for interacting with a running pipeline.
#[derive(Clone)]
pub struct ConnectionHandle {
    writer: WriterHandle,
    chunk: Arc<OnceLock<Arc<ChunkStreamContext>>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Enqueue a raw pre-encoded block, bypassing the multiplexer.
    pub async fn send_raw(&self, data: Bytes) -> Result<WriteReceipt> {
        self.writer.send(data).await
    }

    /// Chunk and enqueue a message on `csid`.
    ///
    /// Fails with [`ChunkwireError::HandshakeIncomplete`] until the
    /// handshake has finished.
    pub async fn multiplex_message(&self, csid: u32, message: Message) -> Result<WriteReceipt> {
        match self.chunk.get() {
            Some(ctx) => ctx.multiplex_message(csid, message).await,
            None => Err(ChunkwireError::HandshakeIncomplete),
        }
    }

    /// Chunk stream context, once the handshake has completed.
    pub fn chunk_context(&self) -> Option<Arc<ChunkStreamContext>> {
        self.chunk.get().cloned()
    }

    /// Request teardown of the pipeline. Safe to call any number of times,
    /// from any task; every call after the first is a no-op.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Check whether the pipeline has shut down or is shutting down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.writer.is_closed()
    }
}

/// The per-connection pipeline. Construct with [`Pipeline::new`], then drive
/// to completion with [`Pipeline::run`].
pub struct Pipeline<S> {
    socket: S,
    config: ConnectionConfig,
    buffer: Arc<ElasticBuffer>,
    pool: BufferPool,
    writer: WriterHandle,
    queue: WriteQueueReceiver,
    chunk: Arc<OnceLock<Arc<ChunkStreamContext>>>,
    messages: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

impl<S> Pipeline<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Build a pipeline over `socket`, returning the pipeline itself, a
    /// handle for sends and teardown, and the channel on which reassembled
    /// messages arrive.
    pub fn new(
        socket: S,
        config: ConnectionConfig,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<Message>) {
        let buffer = Arc::new(ElasticBuffer::new(
            config.buffer_initial,
            config.buffer_max,
            config.resume_writer_threshold,
        ));
        let pool = BufferPool::new(config.read_chunk_size);
        let (writer, queue) = write_queue(&config);
        let chunk = Arc::new(OnceLock::new());
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let handle = ConnectionHandle {
            writer: writer.clone(),
            chunk: chunk.clone(),
            cancel: cancel.clone(),
        };
        let pipeline = Self {
            socket,
            config,
            buffer,
            pool,
            writer,
            queue,
            chunk,
            messages: messages_tx,
            cancel,
        };
        (pipeline, handle, messages_rx)
    }

    /// Run the connection to completion.
    ///
    /// Spawns the writer, producer and consumer loops and waits for all
    /// three. The first loop to finish, for any reason, tears the others
    /// down. The first error reported wins and becomes this method's error;
    /// otherwise the outcome says whether the run ended by peer close or by
    /// cancellation.
    pub async fn run(self) -> Result<Outcome> {
        let user_cancel = self.cancel;
        let internal = user_cancel.child_token();
        let (read_half, write_half) = tokio::io::split(self.socket);
        let (results_tx, mut results_rx) = mpsc::channel::<Result<()>>(3);

        {
            let tx = results_tx.clone();
            let cancel = internal.clone();
            let queue = self.queue;
            tokio::spawn(async move {
                let result = writer_loop(queue, write_half, cancel).await;
                let _ = tx.send(result).await;
            });
        }
        {
            let tx = results_tx.clone();
            let cancel = internal.clone();
            let buffer = self.buffer.clone();
            let pool = self.pool;
            let chunk = self.chunk.clone();
            tokio::spawn(async move {
                let result = producer_loop(read_half, buffer, pool, chunk, cancel).await;
                let _ = tx.send(result).await;
            });
        }
        {
            let tx = results_tx.clone();
            let cancel = internal.clone();
            let requested = user_cancel.clone();
            let buffer = self.buffer.clone();
            let writer = self.writer.clone();
            let chunk = self.chunk.clone();
            let messages = self.messages.clone();
            tokio::spawn(async move {
                let result = consumer_loop(buffer, writer, chunk, messages, cancel, requested).await;
                let _ = tx.send(result).await;
            });
        }
        drop(results_tx);

        let mut first_fault: Result<()> = Ok(());
        let mut finished = 0;
        while let Some(result) = results_rx.recv().await {
            finished += 1;
            if finished == 1 {
                // One loop down means the connection is over; unblock the
                // other two.
                internal.cancel();
                self.buffer.close();
            }
            if let Err(e) = result {
                if first_fault.is_ok() {
                    first_fault = Err(e);
                }
            }
        }

        match first_fault {
            Err(e) => {
                tracing::debug!(error = %e, "pipeline terminated with fault");
                Err(e)
            }
            Ok(()) if user_cancel.is_cancelled() => Ok(Outcome::Cancelled),
            Ok(()) => Ok(Outcome::Completed),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

/// Move raw socket bytes into the shared buffer.
///
/// One pooled block per read; zero bytes read means the peer closed, which
/// ends the loop cleanly after marking the buffer closed so the consumer can
/// finish draining it.
async fn producer_loop<R>(
    mut reader: R,
    buffer: Arc<ElasticBuffer>,
    pool: BufferPool,
    chunk: Arc<OnceLock<Arc<ChunkStreamContext>>>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut block = pool.acquire();
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                pool.release(block);
                return Ok(());
            }
            read = reader.read(&mut block[..]) => read,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) => {
                pool.release(block);
                return Err(ChunkwireError::Io(e));
            }
        };
        if n == 0 {
            pool.release(block);
            tracing::debug!("peer closed the connection");
            buffer.close();
            return Ok(());
        }

        if let Some(ctx) = chunk.get() {
            ctx.record_inbound(n).await?;
        }
        // The buffer only closes once teardown has begun, so a close
        // surfacing here (including out of the backpressure wait) is a
        // clean exit, not a fault.
        match buffer.write(&block[..n]).await {
            Ok(()) => {}
            Err(ChunkwireError::ConnectionClosed) => {
                pool.release(block);
                return Ok(());
            }
            Err(e) => {
                pool.release(block);
                return Err(e);
            }
        }
        pool.release(block);
    }
}

/// Interpret buffered bytes, one handshake stage or chunk state step per
/// iteration, until cancelled or the buffer runs dry after a peer close.
async fn consumer_loop(
    buffer: Arc<ElasticBuffer>,
    writer: WriterHandle,
    chunk: Arc<OnceLock<Arc<ChunkStreamContext>>>,
    messages: mpsc::Sender<Message>,
    cancel: CancellationToken,
    requested: CancellationToken,
) -> Result<()> {
    let mut phase = Phase::Handshaking(HandshakeContext::new(writer.clone()));

    while !cancel.is_cancelled() {
        match &mut phase {
            Phase::Handshaking(handshake) => {
                let progress = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    progress = handshake.advance(&buffer) => progress,
                };
                match progress {
                    Ok(HandshakeProgress::InProgress) => {}
                    Ok(HandshakeProgress::Complete) => {
                        let ctx =
                            Arc::new(ChunkStreamContext::new(writer.clone(), messages.clone()));
                        // First publication wins; the slot is only ever set
                        // here.
                        let _ = chunk.set(ctx.clone());
                        tracing::debug!("handshake complete, switching to chunk streaming");
                        phase = Phase::Streaming(ctx);
                    }
                    // A close triggered by a disconnect request is clean; a
                    // peer vanishing mid-handshake is not.
                    Err(ChunkwireError::ConnectionClosed) => {
                        if requested.is_cancelled() {
                            return Ok(());
                        }
                        return Err(ChunkwireError::Handshake(
                            "connection closed before handshake completed".to_string(),
                        ));
                    }
                    Err(e) => return Err(e),
                }
            }
            Phase::Streaming(ctx) => {
                let step = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    step = ctx.process(&buffer) => step,
                };
                match step {
                    Ok(()) => {}
                    // Peer close in steady state is a clean end.
                    Err(ChunkwireError::ConnectionClosed) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multiplex_before_handshake_fails() {
        let (_socket, ours) = tokio::io::duplex(1024);
        let (_pipeline, handle, _messages) = Pipeline::new(ours, ConnectionConfig::default());

        let result = handle
            .multiplex_message(3, Message::set_chunk_size(4096))
            .await;
        assert!(matches!(result, Err(ChunkwireError::HandshakeIncomplete)));
        assert!(handle.chunk_context().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (_socket, ours) = tokio::io::duplex(1024);
        let (_pipeline, handle, _messages) = Pipeline::new(ours, ConnectionConfig::default());

        assert!(!handle.is_closed());
        handle.disconnect();
        handle.disconnect();
        handle.disconnect();
        assert!(handle.is_closed());
    }
}
