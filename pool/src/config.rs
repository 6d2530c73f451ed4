//! Pool configuration.

use crate::Error;

/// Strategy used to round large buffer sizes into pooled size classes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizingStrategy {
    /// Size classes are consecutive multiples of the large buffer multiple:
    /// `M, 2M, 3M, ..., maximum_buffer_size`.
    Linear,
    /// Size classes are power-of-two multiples of the large buffer multiple:
    /// `M, 2M, 4M, ..., maximum_buffer_size`.
    Exponential,
}

/// Configuration for a [PoolManager](crate::PoolManager).
///
/// All fields are fixed at construction. Mutating policy after buffers are in
/// flight would invalidate the pool's accounting, so no setters exist.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Size of each small block, in bytes.
    pub block_size: usize,
    /// Granularity of pooled large buffers, in bytes.
    pub large_buffer_multiple: usize,
    /// Largest buffer kept in the large pool, in bytes. Requests beyond this
    /// are satisfied with overflow allocations that are never pooled.
    pub maximum_buffer_size: usize,
    /// How large buffer sizes are rounded into size classes.
    pub sizing_strategy: SizingStrategy,
    /// Cap on free bytes retained by the block pool (0 = unlimited).
    pub maximum_free_small_pool_bytes: usize,
    /// Cap on free bytes retained per large size class (0 = unlimited).
    pub maximum_free_large_pool_bytes: usize,
    /// Cap on the capacity of any single stream (0 = unlimited).
    pub maximum_stream_capacity: usize,
    /// Return superseded large buffers to the pool immediately instead of
    /// holding them until their stream is disposed.
    pub aggressive_buffer_return: bool,
    /// Fail [PooledStream::to_array](crate::PooledStream::to_array) instead of
    /// copying. Useful for flushing out code that defeats pooling.
    pub error_on_to_array: bool,
}

impl PoolConfig {
    /// Default size of each small block (128 KiB).
    pub const DEFAULT_BLOCK_SIZE: usize = 128 * 1024;
    /// Default large buffer granularity (1 MiB).
    pub const DEFAULT_LARGE_BUFFER_MULTIPLE: usize = 1024 * 1024;
    /// Default largest pooled buffer (128 MiB).
    pub const DEFAULT_MAXIMUM_BUFFER_SIZE: usize = 128 * 1024 * 1024;

    /// Validates the configuration.
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.block_size == 0 {
            return Err(Error::ZeroBlockSize);
        }
        if self.large_buffer_multiple == 0 {
            return Err(Error::ZeroLargeBufferMultiple);
        }
        if self.maximum_buffer_size < self.block_size {
            return Err(Error::MaximumBufferBelowBlock(
                self.maximum_buffer_size,
                self.block_size,
            ));
        }
        if !self.is_large_buffer_size(self.maximum_buffer_size) {
            return Err(Error::MaximumBufferOffGrid(self.maximum_buffer_size));
        }
        if self.maximum_stream_capacity != 0 && self.maximum_stream_capacity < self.block_size {
            return Err(Error::StreamCapacityBelowBlock(
                self.maximum_stream_capacity,
                self.block_size,
            ));
        }
        Ok(())
    }

    /// Returns whether `size` lands exactly on a size class boundary.
    pub(crate) fn is_large_buffer_size(&self, size: usize) -> bool {
        if size == 0 || size % self.large_buffer_multiple != 0 {
            return false;
        }
        match self.sizing_strategy {
            SizingStrategy::Linear => true,
            SizingStrategy::Exponential => {
                (size / self.large_buffer_multiple).is_power_of_two()
            }
        }
    }

    /// Rounds `required` up to the nearest size class boundary.
    ///
    /// `required` must be non-zero. The result may exceed
    /// `maximum_buffer_size`; such sizes are still rounded to reduce heap
    /// fragmentation even though they are never pooled.
    pub(crate) fn round_large_buffer_size(&self, required: usize) -> usize {
        let multiple = self.large_buffer_multiple;
        match self.sizing_strategy {
            SizingStrategy::Linear => required.div_ceil(multiple) * multiple,
            SizingStrategy::Exponential => {
                let mut size = multiple;
                while size < required {
                    size *= 2;
                }
                size
            }
        }
    }

    /// Returns the size class index for a rounded buffer size, or None if the
    /// size exceeds the largest pooled class.
    ///
    /// `size` must satisfy [Self::is_large_buffer_size].
    pub(crate) fn large_class_index(&self, size: usize) -> Option<usize> {
        if size > self.maximum_buffer_size {
            return None;
        }
        match self.sizing_strategy {
            SizingStrategy::Linear => Some(size / self.large_buffer_multiple - 1),
            SizingStrategy::Exponential => {
                Some((size / self.large_buffer_multiple).trailing_zeros() as usize)
            }
        }
    }

    /// Returns the number of large buffer size classes.
    pub(crate) fn num_large_classes(&self) -> usize {
        let span = self.maximum_buffer_size / self.large_buffer_multiple;
        match self.sizing_strategy {
            SizingStrategy::Linear => span,
            SizingStrategy::Exponential => span.trailing_zeros() as usize + 1,
        }
    }

    /// Returns the buffer size for a given class index.
    pub(crate) fn large_class_size(&self, index: usize) -> usize {
        match self.sizing_strategy {
            SizingStrategy::Linear => (index + 1) * self.large_buffer_multiple,
            SizingStrategy::Exponential => self.large_buffer_multiple << index,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_size: Self::DEFAULT_BLOCK_SIZE,
            large_buffer_multiple: Self::DEFAULT_LARGE_BUFFER_MULTIPLE,
            maximum_buffer_size: Self::DEFAULT_MAXIMUM_BUFFER_SIZE,
            sizing_strategy: SizingStrategy::Linear,
            maximum_free_small_pool_bytes: 0,
            maximum_free_large_pool_bytes: 0,
            maximum_stream_capacity: 0,
            aggressive_buffer_return: false,
            error_on_to_array: false,
        }
    }
}
