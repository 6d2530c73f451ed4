//! Free-list tiers backing the pool.
//!
//! Two tiers exist: [BlockPool] recycles fixed-size blocks used for chunked
//! stream storage, and [LargeBufferPool] recycles variable-size buffers
//! organized into size classes for contiguous storage. Both tiers are
//! lock-free: free lists are [SegQueue]s and all accounting is atomic.
//! Acquisition never blocks; a free-list miss falls back to a fresh
//! allocation.

use crate::{
    config::PoolConfig,
    metrics::{DiscardLabel, DiscardReason, Metrics, SizeClassLabel, Tier},
};
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace};

/// A fixed-size buffer drawn from the block pool.
///
/// Every block is exactly the pool's block size. Fresh blocks are
/// zero-filled; recycled blocks keep whatever bytes their last owner wrote.
pub(crate) struct Block(Vec<u8>);

impl Block {
    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// A buffer drawn from the large buffer pool.
///
/// The length always lands on a size class boundary for the pool's sizing
/// strategy, including overflow buffers (rounding oversize requests reduces
/// heap fragmentation even though they are never pooled). The length alone
/// therefore determines which free list a returned buffer belongs to.
pub(crate) struct LargeBuffer(Vec<u8>);

impl LargeBuffer {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.0
    }

    #[inline]
    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Atomic byte accounting for one tier or size class.
///
/// Invariant: `free + in_use == created - discarded` at quiescence.
#[derive(Default)]
pub(crate) struct Counters {
    /// Bytes sitting in the free list.
    pub(crate) free: AtomicU64,
    /// Bytes currently owned by streams.
    pub(crate) in_use: AtomicU64,
    /// Bytes ever allocated.
    pub(crate) created: AtomicU64,
    /// Bytes dropped instead of pooled.
    pub(crate) discarded: AtomicU64,
}

/// Free-list of fixed-size blocks.
pub(crate) struct BlockPool {
    /// Size of every block, in bytes.
    block_size: usize,
    /// Cap on free bytes retained (0 = unlimited).
    max_free_bytes: usize,
    freelist: SegQueue<Vec<u8>>,
    pub(crate) counters: Counters,
    metrics: Metrics,
}

impl BlockPool {
    pub(crate) fn new(config: &PoolConfig, metrics: Metrics) -> Self {
        Self {
            block_size: config.block_size,
            max_free_bytes: config.maximum_free_small_pool_bytes,
            freelist: SegQueue::new(),
            counters: Counters::default(),
            metrics,
        }
    }

    /// Pops a recycled block or allocates a fresh one. Never blocks.
    pub(crate) fn acquire(&self) -> Block {
        let size = self.block_size as u64;
        let data = match self.freelist.pop() {
            Some(data) => {
                self.counters.free.fetch_sub(size, Ordering::Relaxed);
                self.metrics.small_free_bytes.dec_by(size as i64);
                data
            }
            None => {
                self.counters.created.fetch_add(size, Ordering::Relaxed);
                self.metrics.blocks_created.inc();
                trace!(bytes = self.block_size, "created block");
                vec![0; self.block_size]
            }
        };
        self.counters.in_use.fetch_add(size, Ordering::Relaxed);
        self.metrics.small_in_use_bytes.inc_by(size as i64);
        Block(data)
    }

    /// Returns a batch of blocks to the free list.
    ///
    /// Each block is pooled unless the free-byte cap has been reached; once
    /// it has, the remainder of the batch is dropped without further checks.
    pub(crate) fn release(&self, blocks: Vec<Block>) {
        let size = self.block_size as u64;
        let returned = blocks.len() as u64 * size;
        self.counters.in_use.fetch_sub(returned, Ordering::Relaxed);
        self.metrics.small_in_use_bytes.dec_by(returned as i64);

        let cap = self.max_free_bytes as u64;
        let mut discarded = 0u64;
        for block in blocks {
            if discarded == 0
                && (cap == 0 || self.counters.free.load(Ordering::Relaxed) < cap)
            {
                self.counters.free.fetch_add(size, Ordering::Relaxed);
                self.metrics.small_free_bytes.inc_by(size as i64);
                self.freelist.push(block.0);
            } else {
                discarded += 1;
            }
        }
        if discarded > 0 {
            let bytes = discarded * size;
            self.counters.discarded.fetch_add(bytes, Ordering::Relaxed);
            self.metrics
                .buffers_discarded
                .get_or_create(&DiscardLabel {
                    tier: Tier::Small,
                    reason: DiscardReason::EnoughFree,
                })
                .inc_by(discarded);
            debug!(blocks = discarded, bytes, "discarded blocks, pool has enough free");
        }
    }

    /// Number of blocks sitting in the free list.
    pub(crate) fn free_blocks(&self) -> u64 {
        self.freelist.len() as u64
    }

    /// Bytes sitting in the free list.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.counters.free.load(Ordering::Relaxed)
    }

    /// Bytes currently owned by streams.
    pub(crate) fn in_use_bytes(&self) -> u64 {
        self.counters.in_use.load(Ordering::Relaxed)
    }
}

/// Per-size-class state.
struct SizeClass {
    /// The buffer size for this class, in bytes.
    size: usize,
    freelist: SegQueue<Vec<u8>>,
    counters: Counters,
}

impl SizeClass {
    fn new(size: usize) -> Self {
        Self {
            size,
            freelist: SegQueue::new(),
            counters: Counters::default(),
        }
    }
}

/// Size-classed free lists for large buffers.
pub(crate) struct LargeBufferPool {
    config: PoolConfig,
    classes: Vec<SizeClass>,
    /// Accounting slot for buffers beyond the largest class. Such buffers are
    /// allocated fresh and dropped on return, so `free` stays zero.
    pub(crate) overflow: Counters,
    metrics: Metrics,
}

impl LargeBufferPool {
    pub(crate) fn new(config: PoolConfig, metrics: Metrics) -> Self {
        let classes = (0..config.num_large_classes())
            .map(|index| SizeClass::new(config.large_class_size(index)))
            .collect();
        Self {
            config,
            classes,
            overflow: Counters::default(),
            metrics,
        }
    }

    /// Pops a buffer of at least `required` bytes from the matching size
    /// class, or allocates a fresh one. Never blocks.
    ///
    /// The returned buffer's length is `required` rounded up per the sizing
    /// strategy. Requests beyond the largest class are satisfied with a fresh
    /// allocation tracked only in the overflow slot.
    pub(crate) fn acquire(&self, required: usize) -> LargeBuffer {
        let rounded = self.config.round_large_buffer_size(required.max(1));
        match self.config.large_class_index(rounded) {
            Some(index) => {
                let class = &self.classes[index];
                let size = class.size as u64;
                let label = SizeClassLabel {
                    size_class: size,
                };
                let data = match class.freelist.pop() {
                    Some(data) => {
                        class.counters.free.fetch_sub(size, Ordering::Relaxed);
                        self.metrics
                            .large_free_bytes
                            .get_or_create(&label)
                            .dec_by(size as i64);
                        data
                    }
                    None => {
                        class.counters.created.fetch_add(size, Ordering::Relaxed);
                        self.metrics.large_buffers_created.inc();
                        trace!(bytes = class.size, "created large buffer");
                        vec![0; class.size]
                    }
                };
                class.counters.in_use.fetch_add(size, Ordering::Relaxed);
                self.metrics
                    .large_in_use_bytes
                    .get_or_create(&label)
                    .inc_by(size as i64);
                LargeBuffer(data)
            }
            None => {
                // Beyond the largest class: fresh allocation, never pooled.
                let size = rounded as u64;
                self.overflow.created.fetch_add(size, Ordering::Relaxed);
                self.overflow.in_use.fetch_add(size, Ordering::Relaxed);
                self.metrics.large_buffers_created.inc();
                self.metrics.overflow_in_use_bytes.inc_by(size as i64);
                trace!(bytes = rounded, "created overflow large buffer");
                LargeBuffer(vec![0; rounded])
            }
        }
    }

    /// Returns a buffer to its size class free list.
    ///
    /// The buffer is dropped instead of pooled when its class already holds
    /// the configured maximum of free bytes, or when its length exceeds the
    /// largest pooled class.
    pub(crate) fn release(&self, buffer: LargeBuffer) {
        let len = buffer.len();
        let size = len as u64;
        match self.config.large_class_index(len) {
            Some(index) => {
                let class = &self.classes[index];
                let label = SizeClassLabel {
                    size_class: size,
                };
                class.counters.in_use.fetch_sub(size, Ordering::Relaxed);
                self.metrics
                    .large_in_use_bytes
                    .get_or_create(&label)
                    .dec_by(size as i64);

                let cap = self.config.maximum_free_large_pool_bytes as u64;
                if cap == 0 || class.counters.free.load(Ordering::Relaxed) + size <= cap {
                    class.counters.free.fetch_add(size, Ordering::Relaxed);
                    self.metrics
                        .large_free_bytes
                        .get_or_create(&label)
                        .inc_by(size as i64);
                    class.freelist.push(buffer.0);
                } else {
                    class.counters.discarded.fetch_add(size, Ordering::Relaxed);
                    self.metrics
                        .buffers_discarded
                        .get_or_create(&DiscardLabel {
                            tier: Tier::Large,
                            reason: DiscardReason::EnoughFree,
                        })
                        .inc();
                    debug!(bytes = len, "discarded large buffer, pool has enough free");
                }
            }
            None => {
                self.overflow.in_use.fetch_sub(size, Ordering::Relaxed);
                self.overflow.discarded.fetch_add(size, Ordering::Relaxed);
                self.metrics.overflow_in_use_bytes.dec_by(size as i64);
                self.metrics
                    .buffers_discarded
                    .get_or_create(&DiscardLabel {
                        tier: Tier::Large,
                        reason: DiscardReason::TooLarge,
                    })
                    .inc();
                debug!(bytes = len, "discarded large buffer, too large to pool");
            }
        }
    }

    /// Bytes sitting in free lists across all classes.
    pub(crate) fn free_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|class| class.counters.free.load(Ordering::Relaxed))
            .sum()
    }

    /// Bytes currently owned by streams, including overflow buffers.
    pub(crate) fn in_use_bytes(&self) -> u64 {
        self.classes
            .iter()
            .map(|class| class.counters.in_use.load(Ordering::Relaxed))
            .sum::<u64>()
            + self.overflow.in_use.load(Ordering::Relaxed)
    }

    /// Byte counters for one size class, as
    /// `(free, in_use, created, discarded)`.
    #[cfg(test)]
    pub(crate) fn class_counters(&self, index: usize) -> (u64, u64, u64, u64) {
        let counters = &self.classes[index].counters;
        (
            counters.free.load(Ordering::Relaxed),
            counters.in_use.load(Ordering::Relaxed),
            counters.created.load(Ordering::Relaxed),
            counters.discarded.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizingStrategy;

    fn test_config() -> PoolConfig {
        PoolConfig {
            block_size: 64,
            large_buffer_multiple: 256,
            maximum_buffer_size: 1024,
            sizing_strategy: SizingStrategy::Linear,
            ..PoolConfig::default()
        }
    }

    fn counters(counters: &Counters) -> (u64, u64, u64, u64) {
        (
            counters.free.load(Ordering::Relaxed),
            counters.in_use.load(Ordering::Relaxed),
            counters.created.load(Ordering::Relaxed),
            counters.discarded.load(Ordering::Relaxed),
        )
    }

    #[test]
    fn test_block_acquire_and_release() {
        let pool = BlockPool::new(&test_config(), Metrics::new());

        let block = pool.acquire();
        assert_eq!(block.as_slice().len(), 64);
        assert_eq!(counters(&pool.counters), (0, 64, 64, 0));

        pool.release(vec![block]);
        assert_eq!(counters(&pool.counters), (64, 0, 64, 0));
        assert_eq!(pool.free_blocks(), 1);

        // Reacquire hits the free list instead of allocating.
        let block = pool.acquire();
        assert_eq!(counters(&pool.counters), (0, 64, 64, 0));
        pool.release(vec![block]);
    }

    #[test]
    fn test_block_recycle_keeps_contents() {
        let pool = BlockPool::new(&test_config(), Metrics::new());

        let mut block = pool.acquire();
        assert!(block.as_slice().iter().all(|&b| b == 0));
        block.as_mut_slice().fill(0xAB);
        pool.release(vec![block]);

        // Recycled blocks are not scrubbed.
        let block = pool.acquire();
        assert!(block.as_slice().iter().all(|&b| b == 0xAB));
        pool.release(vec![block]);
    }

    #[test]
    fn test_block_release_stops_at_cap() {
        let config = PoolConfig {
            maximum_free_small_pool_bytes: 128,
            ..test_config()
        };
        let pool = BlockPool::new(&config, Metrics::new());

        let blocks: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        pool.release(blocks);

        // The cap is checked before each push, so two blocks are pooled and
        // the rest of the batch is dropped.
        assert_eq!(counters(&pool.counters), (128, 0, 256, 128));
        assert_eq!(pool.free_blocks(), 2);
    }

    #[test]
    fn test_large_acquire_rounds_to_class() {
        let pool = LargeBufferPool::new(test_config(), Metrics::new());

        let buffer = pool.acquire(100);
        assert_eq!(buffer.len(), 256);
        let buffer2 = pool.acquire(300);
        assert_eq!(buffer2.len(), 512);

        assert_eq!(counters(&pool.classes[0].counters), (0, 256, 256, 0));
        assert_eq!(counters(&pool.classes[1].counters), (0, 512, 512, 0));

        pool.release(buffer);
        pool.release(buffer2);
        assert_eq!(counters(&pool.classes[0].counters), (256, 0, 256, 0));
        assert_eq!(counters(&pool.classes[1].counters), (512, 0, 512, 0));
    }

    #[test]
    fn test_large_reuse_hits_free_list() {
        let pool = LargeBufferPool::new(test_config(), Metrics::new());

        let buffer = pool.acquire(256);
        pool.release(buffer);
        let buffer = pool.acquire(256);

        // Still a single creation.
        assert_eq!(counters(&pool.classes[0].counters), (0, 256, 256, 0));
        pool.release(buffer);
    }

    #[test]
    fn test_large_release_respects_cap() {
        let config = PoolConfig {
            maximum_free_large_pool_bytes: 512,
            ..test_config()
        };
        let pool = LargeBufferPool::new(config, Metrics::new());

        let a = pool.acquire(256);
        let b = pool.acquire(256);
        let c = pool.acquire(256);
        pool.release(a);
        pool.release(b);
        pool.release(c);

        // Two buffers fit under the 512-byte cap, the third is dropped.
        assert_eq!(counters(&pool.classes[0].counters), (512, 0, 768, 256));
    }

    #[test]
    fn test_overflow_never_pooled() {
        let pool = LargeBufferPool::new(test_config(), Metrics::new());

        // 1025 rounds to 1280, beyond the 1024 maximum.
        let buffer = pool.acquire(1025);
        assert_eq!(buffer.len(), 1280);
        assert_eq!(counters(&pool.overflow), (0, 1280, 1280, 0));

        pool.release(buffer);
        assert_eq!(counters(&pool.overflow), (0, 0, 1280, 1280));
        assert_eq!(pool.free_bytes(), 0);
    }

    #[test]
    fn test_tier_aggregates() {
        let pool = LargeBufferPool::new(test_config(), Metrics::new());

        let a = pool.acquire(256);
        let b = pool.acquire(1024);
        assert_eq!(pool.in_use_bytes(), 1280);
        assert_eq!(pool.free_bytes(), 0);

        pool.release(a);
        assert_eq!(pool.in_use_bytes(), 1024);
        assert_eq!(pool.free_bytes(), 256);
        pool.release(b);
        assert_eq!(pool.in_use_bytes(), 0);
        assert_eq!(pool.free_bytes(), 1280);
    }
}
