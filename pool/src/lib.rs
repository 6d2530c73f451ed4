//! Pooled, growable byte streams backed by recycled buffer tiers.
//!
//! # Overview
//!
//! Serialization-heavy services allocate and discard short-lived byte buffers
//! at high rates, fragmenting the heap and stressing the allocator. This crate
//! replaces ad-hoc buffers with a [PoolManager] that recycles two tiers of
//! storage: fixed-size blocks for incremental stream growth and size-classed
//! large buffers for contiguous views. Acquisition never blocks (a pool miss
//! falls back to a fresh allocation) and release is non-blocking, so the pool
//! adds no latency cliffs to hot paths.
//!
//! A [PooledStream] exposes conventional write/read/seek semantics over pooled
//! storage. It starts as a chain of blocks and promotes, one way, to a single
//! large buffer the first time a contiguous view is requested. Disposing the
//! stream (or dropping it, with a leak warning) returns every buffer it owns
//! to the pool.
//!
//! # Concurrency
//!
//! [PoolManager] is a cheap [Clone] handle over shared state and is safe to
//! use from any number of threads. Free lists are lock-free queues and all
//! accounting is atomic. An individual [PooledStream] is single-owner: move it
//! between threads freely, but synchronize externally if multiple threads
//! must touch the same stream.
//!
//! # Example
//!
//! ```rust
//! use bytepool::{PoolConfig, PoolManager};
//!
//! let manager = PoolManager::new(PoolConfig::default()).unwrap();
//!
//! // Build a stream incrementally out of pooled blocks.
//! let mut stream = manager.get_stream();
//! stream.write(b"hello world").unwrap();
//!
//! // Read the content back.
//! stream.set_position(0);
//! let mut out = vec![0u8; 11];
//! assert_eq!(stream.read(&mut out), 11);
//! assert_eq!(&out, b"hello world");
//!
//! // Promote to a single contiguous buffer.
//! assert_eq!(stream.get_contiguous_buffer(), b"hello world");
//!
//! // Return all storage to the pool.
//! stream.dispose();
//! ```

mod config;
mod manager;
mod metrics;
mod pool;
mod stream;

pub use config::{PoolConfig, SizingStrategy};
pub use manager::{PoolManager, PoolStats};
pub use stream::PooledStream;

use thiserror::Error;

/// Errors that can occur when configuring a pool or operating on a stream.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("block size must be non-zero")]
    ZeroBlockSize,
    #[error("large buffer multiple must be non-zero")]
    ZeroLargeBufferMultiple,
    #[error("maximum buffer size {0} is smaller than block size {1}")]
    MaximumBufferBelowBlock(usize, usize),
    #[error("maximum buffer size {0} does not satisfy the sizing strategy rounding rule")]
    MaximumBufferOffGrid(usize),
    #[error("maximum stream capacity {0} is smaller than block size {1}")]
    StreamCapacityBelowBlock(usize, usize),

    // Capacity errors
    #[error("requested capacity {0} exceeds maximum stream capacity {1}")]
    CapacityExceeded(usize, usize),

    // Argument errors
    #[error("seek before start of stream")]
    SeekBeforeStart,
    #[error("position overflow")]
    PositionOverflow,
    #[error("invalid range: offset {0} plus count {1} exceeds length {2}")]
    InvalidRange(usize, usize, usize),

    // Policy errors
    #[error("to_array is disallowed by pool configuration")]
    ToArrayDisallowed,

    // I/O errors
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            Error::SeekBeforeStart | Error::PositionOverflow | Error::InvalidRange(..) => {
                Self::new(std::io::ErrorKind::InvalidInput, err)
            }
            err => Self::other(err),
        }
    }
}
