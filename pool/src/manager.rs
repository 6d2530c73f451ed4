//! Shared pool handle composing the block and large buffer tiers.

use crate::{
    config::PoolConfig,
    metrics::Metrics,
    pool::{Block, BlockPool, LargeBuffer, LargeBufferPool},
    stream::PooledStream,
    Error,
};
use prometheus_client::registry::Registry;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::debug;
use uuid::Uuid;

/// Handle to a shared buffer pool.
///
/// Cloning is cheap and all clones refer to the same pool, so a single
/// manager can be constructed by the composition root and handed to every
/// stream producer. All operations are lock-free and never block.
#[derive(Clone)]
pub struct PoolManager {
    pub(crate) inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) blocks: BlockPool,
    pub(crate) large: LargeBufferPool,
    pub(crate) metrics: Metrics,
    streams_created: AtomicU64,
    streams_disposed: AtomicU64,
    streams_finalized: AtomicU64,
}

/// Point-in-time snapshot of pool usage.
#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
    /// Bytes sitting in the block pool free list.
    pub small_pool_free_bytes: u64,
    /// Bytes of blocks currently owned by streams.
    pub small_pool_in_use_bytes: u64,
    /// Bytes sitting in large pool free lists.
    pub large_pool_free_bytes: u64,
    /// Bytes of large buffers currently owned by streams, including
    /// overflow buffers.
    pub large_pool_in_use_bytes: u64,
    /// Number of blocks in the free list.
    pub blocks_free: u64,
    /// Total streams handed out.
    pub streams_created: u64,
    /// Total streams explicitly disposed.
    pub streams_disposed: u64,
    /// Total streams reclaimed by drop without an explicit dispose.
    pub streams_finalized: u64,
}

impl PoolManager {
    /// Creates a pool manager with the given configuration.
    ///
    /// Fails if the configuration is inconsistent (see [PoolConfig]). The
    /// configuration is fixed for the life of the manager.
    pub fn new(config: PoolConfig) -> Result<Self, Error> {
        config.validate()?;
        let metrics = Metrics::new();
        let blocks = BlockPool::new(&config, metrics.clone());
        let large = LargeBufferPool::new(config.clone(), metrics.clone());
        debug!(?config, "pool manager created");
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                blocks,
                large,
                metrics,
                streams_created: AtomicU64::new(0),
                streams_disposed: AtomicU64::new(0),
                streams_finalized: AtomicU64::new(0),
            }),
        })
    }

    /// Registers the pool's metrics with the given registry.
    pub fn register_metrics(&self, registry: &mut Registry) {
        self.inner.metrics.register(registry);
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquires a stream with default settings (anonymous, one block of
    /// initial capacity, chunked storage).
    pub fn get_stream(&self) -> PooledStream {
        self.create_stream(None, None, 0, false)
    }

    /// Acquires a stream with at least `required_size` bytes of capacity.
    ///
    /// `id` and `tag` identify the stream in diagnostics; a random id is
    /// assigned when none is given. When `as_contiguous_buffer` is set and
    /// `required_size` exceeds the block size, the stream is backed by a
    /// single large buffer from the start instead of being promoted later.
    ///
    /// Fails if the stream would be provisioned beyond the maximum stream
    /// capacity.
    pub fn get_stream_with(
        &self,
        id: Option<Uuid>,
        tag: Option<&str>,
        required_size: usize,
        as_contiguous_buffer: bool,
    ) -> Result<PooledStream, Error> {
        let max = self.inner.config.maximum_stream_capacity;
        let provision = required_size.max(self.inner.config.block_size);
        if max != 0 && provision > max {
            return Err(Error::CapacityExceeded(provision, max));
        }
        Ok(self.create_stream(id, tag, required_size, as_contiguous_buffer))
    }

    /// Acquires a stream initialized with a copy of `buf`, positioned at the
    /// start.
    pub fn get_stream_from(
        &self,
        id: Option<Uuid>,
        tag: Option<&str>,
        buf: &[u8],
    ) -> Result<PooledStream, Error> {
        let mut stream = self.get_stream_with(id, tag, buf.len(), false)?;
        stream.write(buf)?;
        stream.set_position(0);
        Ok(stream)
    }

    fn create_stream(
        &self,
        id: Option<Uuid>,
        tag: Option<&str>,
        required_size: usize,
        as_contiguous_buffer: bool,
    ) -> PooledStream {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let tag = tag.map(str::to_owned);
        self.inner.streams_created.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.streams_created.inc();
        debug!(%id, ?tag, size = required_size, "stream created");
        PooledStream::new(self.clone(), id, tag, required_size, as_contiguous_buffer)
    }

    /// Returns a snapshot of pool usage.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            small_pool_free_bytes: self.inner.blocks.free_bytes(),
            small_pool_in_use_bytes: self.inner.blocks.in_use_bytes(),
            large_pool_free_bytes: self.inner.large.free_bytes(),
            large_pool_in_use_bytes: self.inner.large.in_use_bytes(),
            blocks_free: self.inner.blocks.free_blocks(),
            streams_created: self.inner.streams_created.load(Ordering::Relaxed),
            streams_disposed: self.inner.streams_disposed.load(Ordering::Relaxed),
            streams_finalized: self.inner.streams_finalized.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn acquire_block(&self) -> Block {
        self.inner.blocks.acquire()
    }

    pub(crate) fn release_blocks(&self, blocks: Vec<Block>) {
        self.inner.blocks.release(blocks);
    }

    pub(crate) fn acquire_large(&self, required: usize) -> LargeBuffer {
        self.inner.large.acquire(required)
    }

    pub(crate) fn release_large(&self, buffer: LargeBuffer) {
        self.inner.large.release(buffer);
    }

    pub(crate) fn note_stream_disposed(&self, length: usize) {
        self.inner.streams_disposed.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.streams_disposed.inc();
        self.inner.metrics.stream_length.observe(length as f64);
    }

    pub(crate) fn note_stream_finalized(&self, length: usize) {
        self.inner.streams_finalized.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.streams_finalized.inc();
        self.inner.metrics.stream_length.observe(length as f64);
    }

    pub(crate) fn note_stream_to_array(&self) {
        self.inner.metrics.stream_to_array.inc();
    }
}

impl fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingStrategy;
    use prometheus_client::encoding::text::encode;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    fn test_config() -> PoolConfig {
        PoolConfig {
            block_size: 64,
            large_buffer_multiple: 256,
            maximum_buffer_size: 1024,
            sizing_strategy: SizingStrategy::Linear,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = PoolConfig {
            block_size: 0,
            ..test_config()
        };
        assert!(matches!(
            PoolManager::new(config),
            Err(Error::ZeroBlockSize)
        ));
    }

    #[test]
    fn test_get_stream_defaults() {
        let manager = PoolManager::new(test_config()).unwrap();

        let stream = manager.get_stream();
        assert_eq!(stream.length(), 0);
        assert_eq!(stream.position(), 0);
        assert_eq!(stream.capacity(), 64);

        let stats = manager.stats();
        assert_eq!(stats.streams_created, 1);
        assert_eq!(stats.small_pool_in_use_bytes, 64);

        stream.dispose();
        let stats = manager.stats();
        assert_eq!(stats.streams_disposed, 1);
        assert_eq!(stats.small_pool_in_use_bytes, 0);
        assert_eq!(stats.small_pool_free_bytes, 64);
        assert_eq!(stats.blocks_free, 1);
    }

    #[test]
    fn test_get_stream_with_sizes_storage() {
        let manager = PoolManager::new(test_config()).unwrap();

        // Small requests stay chunked even when contiguous access was asked
        // for, since a single block is already contiguous.
        let stream = manager
            .get_stream_with(None, Some("small"), 32, true)
            .unwrap();
        assert_eq!(stream.capacity(), 64);
        assert_eq!(manager.stats().large_pool_in_use_bytes, 0);
        stream.dispose();

        let stream = manager
            .get_stream_with(None, Some("large"), 300, true)
            .unwrap();
        assert_eq!(stream.capacity(), 512);
        assert_eq!(manager.stats().large_pool_in_use_bytes, 512);
        assert_eq!(manager.stats().small_pool_in_use_bytes, 0);
        stream.dispose();
        assert_eq!(manager.stats().large_pool_free_bytes, 512);
    }

    #[test]
    fn test_stream_identity() {
        let manager = PoolManager::new(test_config()).unwrap();

        let id = Uuid::new_v4();
        let stream = manager
            .get_stream_with(Some(id), Some("request"), 0, false)
            .unwrap();
        assert_eq!(stream.id(), id);
        assert_eq!(stream.tag(), Some("request"));
        stream.dispose();

        // Streams without an explicit id get distinct random ones.
        let a = manager.get_stream();
        let b = manager.get_stream();
        assert_ne!(a.id(), b.id());
        a.dispose();
        b.dispose();
    }

    #[test]
    fn test_capacity_checked_at_creation() {
        let config = PoolConfig {
            maximum_stream_capacity: 128,
            ..test_config()
        };
        let manager = PoolManager::new(config).unwrap();

        assert!(matches!(
            manager.get_stream_with(None, None, 129, false),
            Err(Error::CapacityExceeded(129, 128))
        ));
        // Nothing was acquired for the rejected stream.
        assert_eq!(manager.stats().small_pool_in_use_bytes, 0);
        assert_eq!(manager.stats().streams_created, 0);

        let stream = manager.get_stream_with(None, None, 128, false).unwrap();
        assert_eq!(stream.capacity(), 128);
        stream.dispose();
    }

    #[test]
    fn test_get_stream_from_copies() {
        let manager = PoolManager::new(test_config()).unwrap();

        let mut data = vec![0u8; 200];
        StdRng::seed_from_u64(7).fill_bytes(&mut data);

        let mut stream = manager.get_stream_from(None, Some("copy"), &data).unwrap();
        assert_eq!(stream.length(), 200);
        assert_eq!(stream.position(), 0);

        let mut read = vec![0u8; 200];
        assert_eq!(stream.read(&mut read), 200);
        assert_eq!(read, data);
        stream.dispose();
    }

    #[test]
    fn test_metrics_registered() {
        let manager = PoolManager::new(test_config()).unwrap();
        let mut registry = Registry::default();
        manager.register_metrics(&mut registry);

        let stream = manager.get_stream();
        stream.dispose();

        let mut encoded = String::new();
        encode(&mut encoded, &registry).unwrap();
        assert!(encoded.contains("pool_blocks_created"));
        assert!(encoded.contains("pool_streams_disposed"));
        assert!(encoded.contains("pool_small_free_bytes"));
    }

    #[test]
    fn test_multithreaded_conservation() {
        cfg_if::cfg_if! {
            if #[cfg(miri)] {
                const STREAMS: usize = 4;
            } else {
                const STREAMS: usize = 128;
            }
        }

        let manager = PoolManager::new(test_config()).unwrap();
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker);
                for _ in 0..STREAMS {
                    let mut data = vec![0u8; 1 + (rng.next_u32() as usize % 512)];
                    rng.fill_bytes(&mut data);
                    let mut stream = manager.get_stream();
                    stream.write(&data).unwrap();
                    if data.len() % 2 == 0 {
                        assert_eq!(stream.get_contiguous_buffer(), &data[..]);
                    }
                    stream.dispose();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Everything was returned, so for each tier the free list holds
        // exactly what was created and not discarded.
        let stats = manager.stats();
        assert_eq!(stats.small_pool_in_use_bytes, 0);
        assert_eq!(stats.large_pool_in_use_bytes, 0);
        assert_eq!(stats.streams_disposed, stats.streams_created);

        let blocks = &manager.inner.blocks.counters;
        assert_eq!(
            blocks.free.load(Ordering::Relaxed),
            blocks.created.load(Ordering::Relaxed) - blocks.discarded.load(Ordering::Relaxed)
        );
        for class in 0..manager.config().num_large_classes() {
            let (free, in_use, created, discarded) = manager.inner.large.class_counters(class);
            assert_eq!(in_use, 0);
            assert_eq!(free, created - discarded);
        }
    }
}
