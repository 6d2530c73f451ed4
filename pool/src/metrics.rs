//! Prometheus instruments for pool activity.

use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{
        counter::Counter,
        family::Family,
        gauge::Gauge,
        histogram::{exponential_buckets, Histogram},
    },
    registry::Registry,
};

/// Metric label identifying which pool tier a buffer belonged to.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum Tier {
    /// The fixed-size block pool.
    Small,
    /// The size-classed large buffer pool.
    Large,
}

/// Metric label describing why a buffer was discarded instead of pooled.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum DiscardReason {
    /// The free pool already holds its configured maximum.
    EnoughFree,
    /// The buffer exceeds the largest pooled size class.
    TooLarge,
}

/// Label set for discard counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct DiscardLabel {
    pub tier: Tier,
    pub reason: DiscardReason,
}

/// Label set identifying a large buffer size class.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub(crate) struct SizeClassLabel {
    pub size_class: u64,
}

/// Instruments mirroring the pool's atomic accounting.
///
/// All fields are cheap handles over shared state, so the struct can be
/// cloned into each pool tier while one copy stays registered.
#[derive(Clone)]
pub(crate) struct Metrics {
    /// Total blocks allocated because the free list was empty.
    pub blocks_created: Counter,
    /// Total large buffers allocated because the class free list was empty.
    pub large_buffers_created: Counter,
    /// Total buffers dropped instead of pooled, by tier and reason.
    pub buffers_discarded: Family<DiscardLabel, Counter>,
    /// Total streams handed out.
    pub streams_created: Counter,
    /// Total streams explicitly disposed.
    pub streams_disposed: Counter,
    /// Total streams reclaimed by drop without an explicit dispose.
    pub streams_finalized: Counter,
    /// Total calls to to_array.
    pub stream_to_array: Counter,
    /// Final length of disposed streams, in bytes.
    pub stream_length: Histogram,
    /// Bytes sitting in the block pool free list.
    pub small_free_bytes: Gauge,
    /// Bytes of blocks currently owned by streams.
    pub small_in_use_bytes: Gauge,
    /// Bytes sitting in large pool free lists, by size class.
    pub large_free_bytes: Family<SizeClassLabel, Gauge>,
    /// Bytes of pooled large buffers currently owned by streams, by size class.
    pub large_in_use_bytes: Family<SizeClassLabel, Gauge>,
    /// Bytes of overflow buffers currently owned by streams.
    pub overflow_in_use_bytes: Gauge,
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self {
            blocks_created: Counter::default(),
            large_buffers_created: Counter::default(),
            buffers_discarded: Family::default(),
            streams_created: Counter::default(),
            streams_disposed: Counter::default(),
            streams_finalized: Counter::default(),
            stream_to_array: Counter::default(),
            // Stream lengths from 1 KiB up to 256 MiB.
            stream_length: Histogram::new(exponential_buckets(1024.0, 4.0, 10)),
            small_free_bytes: Gauge::default(),
            small_in_use_bytes: Gauge::default(),
            large_free_bytes: Family::default(),
            large_in_use_bytes: Family::default(),
            overflow_in_use_bytes: Gauge::default(),
        }
    }

    /// Registers every instrument with `registry`.
    pub(crate) fn register(&self, registry: &mut Registry) {
        registry.register(
            "pool_blocks_created",
            "Total blocks allocated because the free list was empty",
            self.blocks_created.clone(),
        );
        registry.register(
            "pool_large_buffers_created",
            "Total large buffers allocated because the class free list was empty",
            self.large_buffers_created.clone(),
        );
        registry.register(
            "pool_buffers_discarded",
            "Total buffers dropped instead of pooled, by tier and reason",
            self.buffers_discarded.clone(),
        );
        registry.register(
            "pool_streams_created",
            "Total streams handed out",
            self.streams_created.clone(),
        );
        registry.register(
            "pool_streams_disposed",
            "Total streams explicitly disposed",
            self.streams_disposed.clone(),
        );
        registry.register(
            "pool_streams_finalized",
            "Total streams reclaimed by drop without an explicit dispose",
            self.streams_finalized.clone(),
        );
        registry.register(
            "pool_stream_to_array",
            "Total calls to to_array",
            self.stream_to_array.clone(),
        );
        registry.register(
            "pool_stream_length_bytes",
            "Final length of disposed streams",
            self.stream_length.clone(),
        );
        registry.register(
            "pool_small_free_bytes",
            "Bytes sitting in the block pool free list",
            self.small_free_bytes.clone(),
        );
        registry.register(
            "pool_small_in_use_bytes",
            "Bytes of blocks currently owned by streams",
            self.small_in_use_bytes.clone(),
        );
        registry.register(
            "pool_large_free_bytes",
            "Bytes sitting in large pool free lists, by size class",
            self.large_free_bytes.clone(),
        );
        registry.register(
            "pool_large_in_use_bytes",
            "Bytes of pooled large buffers currently owned by streams, by size class",
            self.large_in_use_bytes.clone(),
        );
        registry.register(
            "pool_overflow_in_use_bytes",
            "Bytes of overflow buffers currently owned by streams",
            self.overflow_in_use_bytes.clone(),
        );
    }
}
