//! Connection configuration.
//!
//! Bundles the tunables the pipeline needs: receive buffer growth bounds,
//! backpressure thresholds and write-queue limits. All fields have defaults
//! matching the reference server's constants, and the struct derives
//! `Deserialize` so it can be loaded from a config file by the host.

use std::time::Duration;

use serde::Deserialize;

/// Default initial capacity of the receive buffer.
pub const DEFAULT_BUFFER_INITIAL: usize = 2048;

/// Default maximum size the receive buffer may grow to.
pub const DEFAULT_BUFFER_MAX: usize = 32767;

/// Default threshold above which the producer is throttled until the
/// consumer drains the buffer.
pub const DEFAULT_RESUME_WRITER_THRESHOLD: usize = 65535;

/// Default size of a single socket receive.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 2048;

/// Default write-queue channel capacity.
pub const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 1024;

/// Default maximum pending writes before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Initial capacity of the elastic receive buffer.
    pub buffer_initial: usize,
    /// Maximum size the receive buffer may grow to. Exceeding this is a
    /// fatal `BufferExhausted` error, not a silent drop.
    pub buffer_max: usize,
    /// Buffered-byte threshold above which `ElasticBuffer::write` suspends
    /// until the reader drains below it.
    pub resume_writer_threshold: usize,
    /// Number of bytes requested per socket receive.
    pub read_chunk_size: usize,
    /// Capacity of the write-queue channel.
    pub writer_queue_capacity: usize,
    /// Maximum pending writes before `send` waits for the queue to drain.
    pub max_pending_writes: usize,
    /// How long `send` waits for backpressure to clear.
    #[serde(with = "duration_secs")]
    pub backpressure_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_initial: DEFAULT_BUFFER_INITIAL,
            buffer_max: DEFAULT_BUFFER_MAX,
            resume_writer_threshold: DEFAULT_RESUME_WRITER_THRESHOLD,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            writer_queue_capacity: DEFAULT_WRITER_QUEUE_CAPACITY,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
