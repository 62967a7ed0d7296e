//! Chunk stream layer: headers, messages and the per-connection context.

mod context;
mod header;
mod message;

pub use context::{ChunkState, ChunkStreamContext};
pub use header::{BasicHeader, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
pub use message::{Message, MessageType};
