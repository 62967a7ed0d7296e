//! Per-connection I/O engine for RTMP-style chunked streaming transports.
//!
//! `chunkwire` owns everything between a connected socket and the session
//! layer above it: an elastic receive buffer with backpressure, a dedicated
//! writer task fed by a FIFO queue of owned byte blocks, the server-side
//! handshake, and chunk stream demultiplexing with window-acknowledgement
//! flow control.
//!
//! # Quick start
//!
//! ```no_run
//! use chunkwire::{ConnectionConfig, Pipeline};
//!
//! # async fn accept(socket: tokio::net::TcpStream) -> chunkwire::Result<()> {
//! let (pipeline, handle, mut messages) = Pipeline::new(socket, ConnectionConfig::default());
//!
//! tokio::spawn(async move {
//!     while let Some(message) = messages.recv().await {
//!         // hand reassembled messages to the session layer
//!         let _ = message;
//!     }
//! });
//!
//! let outcome = pipeline.run().await?;
//! let _ = (outcome, handle);
//! # Ok(())
//! # }
//! ```
//!
//! The session layer interacts with a running pipeline only through the
//! [`ConnectionHandle`]: enqueue outbound messages, inspect the chunk
//! context, or tear the connection down.

pub mod buffer;
pub mod chunk;
pub mod config;
pub mod error;
pub mod handshake;
pub mod pipeline;
pub mod pool;
pub mod writer;

pub use buffer::ElasticBuffer;
pub use chunk::{ChunkStreamContext, Message, MessageType};
pub use config::ConnectionConfig;
pub use error::{ChunkwireError, Result};
pub use handshake::{HandshakeProgress, HandshakeStage, HANDSHAKE_SIZE, RTMP_VERSION};
pub use pipeline::{ConnectionHandle, Outcome, Pipeline};
pub use writer::{WriteReceipt, WriterHandle};
