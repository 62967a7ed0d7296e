//! Receive-buffer pool.
//!
//! The producer loop performs one socket receive per iteration into a pooled
//! block, then returns the block after appending the bytes to the elastic
//! buffer. Recycling the blocks keeps the receive path allocation-free in
//! steady state. Outbound blocks are not pooled: they are `Bytes` whose
//! ownership moves into the write queue and is dropped exactly once by the
//! writer loop.

use std::sync::Mutex;

use bytes::BytesMut;

/// Maximum number of idle blocks kept for reuse.
const MAX_IDLE_BLOCKS: usize = 8;

/// A capped free-list of reusable receive blocks.
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    block_size: usize,
}

impl BufferPool {
    /// Create a pool handing out blocks of `block_size` bytes.
    pub fn new(block_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            block_size,
        }
    }

    /// Take a zeroed block of `block_size` length from the pool, allocating
    /// if none are idle.
    pub fn acquire(&self) -> BytesMut {
        let recycled = self.free.lock().expect("pool lock poisoned").pop();
        let mut block = recycled.unwrap_or_else(|| BytesMut::with_capacity(self.block_size));
        block.resize(self.block_size, 0);
        block
    }

    /// Return a block to the pool. Blocks beyond the idle cap are dropped.
    pub fn release(&self, mut block: BytesMut) {
        block.clear();
        let mut free = self.free.lock().expect("pool lock poisoned");
        if free.len() < MAX_IDLE_BLOCKS {
            free.push(block);
        }
    }

    /// Number of idle blocks currently held.
    pub fn idle_count(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }

    /// Size of the blocks this pool hands out.
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}
