//! Growable, seekable byte stream over pooled storage.

use crate::{
    manager::PoolManager,
    pool::{Block, LargeBuffer},
    Error,
};
use bytes::{buf::UninitSlice, Buf, BufMut};
use std::{
    fmt,
    io::{self, SeekFrom},
    mem,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Backing storage for a stream.
enum Storage {
    /// Ordered fixed-size blocks. Capacity is the sum of the block sizes.
    Chunked(Vec<Block>),
    /// One buffer spanning the whole capacity.
    Contiguous(LargeBuffer),
}

/// A growable byte stream drawn from a [PoolManager].
///
/// The stream starts as a chain of pooled blocks and switches, one way, to a
/// single pooled large buffer the first time [Self::get_contiguous_buffer] is
/// called (or immediately, if contiguous access was requested at
/// acquisition). Writes past the current capacity grow the storage; capacity
/// never shrinks for the life of the stream.
///
/// Call [Self::dispose] when done to return the storage to the pool. A stream
/// dropped without dispose still releases its storage, but logs a warning
/// since relying on drop hides the release from the caller's control flow.
///
/// A stream is single-owner: it can move between threads but concurrent use
/// requires external synchronization, like any in-memory buffer.
pub struct PooledStream {
    manager: PoolManager,
    id: Uuid,
    tag: Option<String>,
    storage: Storage,
    /// Superseded contiguous buffers, held until dispose so callers that
    /// unsafely retained a view of them read stale data instead of recycled
    /// data. Empty when the pool returns buffers aggressively.
    dirty: Vec<LargeBuffer>,
    length: usize,
    position: usize,
    disposed: bool,
}

impl PooledStream {
    /// Acquires storage for a new stream.
    ///
    /// At least one block (or, for contiguous requests beyond the block size,
    /// one large buffer covering `required_size`) is acquired up front.
    pub(crate) fn new(
        manager: PoolManager,
        id: Uuid,
        tag: Option<String>,
        required_size: usize,
        as_contiguous_buffer: bool,
    ) -> Self {
        let block_size = manager.config().block_size;
        let required = required_size.max(block_size);
        let storage = if as_contiguous_buffer && required > block_size {
            Storage::Contiguous(manager.acquire_large(required))
        } else {
            let count = required.div_ceil(block_size);
            let mut blocks = Vec::with_capacity(count);
            for _ in 0..count {
                blocks.push(manager.acquire_block());
            }
            Storage::Chunked(blocks)
        };
        Self {
            manager,
            id,
            tag,
            storage,
            dirty: Vec::new(),
            length: 0,
            position: 0,
            disposed: false,
        }
    }

    /// Returns the stream's identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the tag given at acquisition, if any.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Returns the number of bytes written to the stream.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the current read/write position.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Returns the bytes of storage currently backing the stream.
    pub fn capacity(&self) -> usize {
        match &self.storage {
            Storage::Chunked(blocks) => blocks.len() * self.manager.config().block_size,
            Storage::Contiguous(buffer) => buffer.len(),
        }
    }

    /// Copies `buf` into the stream at the current position, growing storage
    /// as needed, then advances the position past the written bytes.
    ///
    /// Writing at a position beyond the current length extends the length to
    /// cover the position first; the bytes in between are whatever the
    /// underlying storage already holds (zeros for storage that was never
    /// recycled).
    ///
    /// Fails without changing the stream if growth would exceed the maximum
    /// stream capacity.
    pub fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let end = self
            .position
            .checked_add(buf.len())
            .ok_or(Error::PositionOverflow)?;
        self.ensure_capacity(end)?;
        self.write_at(buf, self.position);
        self.position = end;
        if self.position > self.length {
            self.length = self.position;
        }
        Ok(())
    }

    /// Writes a single byte at the current position.
    pub fn write_byte(&mut self, byte: u8) -> Result<(), Error> {
        self.write(&[byte])
    }

    /// Copies up to `buf.len()` bytes from the current position into `buf`,
    /// advancing the position. Returns the number of bytes copied, which is 0
    /// at the end of the stream.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let available = self.length.saturating_sub(self.position);
        let count = available.min(buf.len());
        if count == 0 {
            return 0;
        }
        self.read_at(&mut buf[..count], self.position);
        self.position += count;
        count
    }

    /// Reads the byte at the current position, or `None` at the end of the
    /// stream.
    pub fn read_byte(&mut self) -> Option<u8> {
        let mut byte = [0u8];
        if self.read(&mut byte) == 1 {
            Some(byte[0])
        } else {
            None
        }
    }

    /// Moves the position per standard seek semantics.
    ///
    /// Seeking past the end is allowed (a later write extends the stream);
    /// seeking before the start fails.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<usize, Error> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => self.position as i128 + i128::from(delta),
            SeekFrom::End(delta) => self.length as i128 + i128::from(delta),
        };
        if target < 0 {
            return Err(Error::SeekBeforeStart);
        }
        let target = usize::try_from(target).map_err(|_| Error::PositionOverflow)?;
        self.position = target;
        Ok(target)
    }

    /// Sets the position directly. Positions beyond the current length are
    /// allowed.
    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Sets the stream length, growing storage as needed and clamping the
    /// position down to the new length.
    ///
    /// Growing exposes whatever bytes the underlying storage already holds.
    /// Storage that was never recycled reads as zeros, but a shrink followed
    /// by a grow re-exposes the previously written bytes.
    pub fn set_length(&mut self, length: usize) -> Result<(), Error> {
        self.ensure_capacity(length)?;
        self.length = length;
        if self.position > length {
            self.position = length;
        }
        Ok(())
    }

    /// Returns the stream content as one contiguous slice, switching the
    /// stream to contiguous storage on first use.
    ///
    /// The switch acquires a large buffer covering the current capacity,
    /// copies the content in, and releases the stream's blocks back to the
    /// pool. Later calls return the same buffer until a write or
    /// [Self::set_length] outgrows it.
    pub fn get_contiguous_buffer(&mut self) -> &[u8] {
        self.promote();
        match &self.storage {
            Storage::Contiguous(buffer) => &buffer.as_slice()[..self.length],
            Storage::Chunked(_) => unreachable!("stream was just promoted"),
        }
    }

    /// Copies the stream content into a fresh `Vec`.
    ///
    /// Every call allocates and copies, defeating the point of pooling, so
    /// the call is counted and can be disallowed outright via
    /// [crate::PoolConfig::error_on_to_array]. Prefer
    /// [Self::get_contiguous_buffer] or [Self::write_to].
    pub fn to_array(&self) -> Result<Vec<u8>, Error> {
        self.manager.note_stream_to_array();
        if self.manager.config().error_on_to_array {
            warn!(id = %self.id, tag = ?self.tag, "to_array called while disallowed");
            return Err(Error::ToArrayDisallowed);
        }
        debug!(id = %self.id, tag = ?self.tag, length = self.length, "stream copied to array");
        let mut out = vec![0; self.length];
        self.read_at(&mut out, 0);
        Ok(out)
    }

    /// Writes the entire stream content to `sink` without materializing a
    /// contiguous buffer.
    pub fn write_to<W: io::Write>(&self, sink: &mut W) -> Result<(), Error> {
        self.write_range_to(sink, 0, self.length)
    }

    /// Writes `count` bytes starting at `offset` to `sink`, straight from
    /// the underlying blocks or buffer.
    ///
    /// Fails if the range extends past the stream length.
    pub fn write_range_to<W: io::Write>(
        &self,
        sink: &mut W,
        offset: usize,
        count: usize,
    ) -> Result<(), Error> {
        let end = offset.checked_add(count).ok_or(Error::PositionOverflow)?;
        if end > self.length {
            return Err(Error::InvalidRange(offset, count, self.length));
        }
        match &self.storage {
            Storage::Contiguous(buffer) => sink.write_all(&buffer.as_slice()[offset..end])?,
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                let mut offset = offset;
                let mut remaining = count;
                while remaining > 0 {
                    let index = offset / block_size;
                    let within = offset % block_size;
                    let take = (block_size - within).min(remaining);
                    sink.write_all(&blocks[index].as_slice()[within..within + take])?;
                    offset += take;
                    remaining -= take;
                }
            }
        }
        Ok(())
    }

    /// Returns the stream's storage to the pool.
    ///
    /// Consuming the stream makes use-after-dispose and double-dispose
    /// impossible to express, so the release runs exactly once.
    pub fn dispose(mut self) {
        debug!(id = %self.id, tag = ?self.tag, length = self.length, "stream disposed");
        self.manager.note_stream_disposed(self.length);
        self.release_storage();
    }

    /// Grows storage to hold at least `required` bytes.
    ///
    /// The capacity limit is checked before anything is acquired, so a
    /// failed call leaves the stream untouched. Chunked storage grows by
    /// whole blocks; contiguous storage is swapped for a larger buffer with
    /// the content copied across.
    fn ensure_capacity(&mut self, required: usize) -> Result<(), Error> {
        let max = self.manager.config().maximum_stream_capacity;
        if max != 0 && required > max {
            return Err(Error::CapacityExceeded(required, max));
        }
        if required <= self.capacity() {
            return Ok(());
        }
        match &mut self.storage {
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                while blocks.len() * block_size < required {
                    blocks.push(self.manager.acquire_block());
                }
            }
            Storage::Contiguous(buffer) => {
                let mut grown = self.manager.acquire_large(required);
                grown.as_mut_slice()[..self.length]
                    .copy_from_slice(&buffer.as_slice()[..self.length]);
                let retired = mem::replace(buffer, grown);
                if self.manager.config().aggressive_buffer_return {
                    self.manager.release_large(retired);
                } else {
                    self.dirty.push(retired);
                }
            }
        }
        Ok(())
    }

    /// Switches chunked storage to one contiguous buffer covering the
    /// current capacity. The blocks are released back to the pool. No-op if
    /// the stream is already contiguous.
    fn promote(&mut self) {
        if matches!(self.storage, Storage::Contiguous(_)) {
            return;
        }
        let mut buffer = self.manager.acquire_large(self.capacity());
        self.read_at(&mut buffer.as_mut_slice()[..self.length], 0);
        let old = mem::replace(&mut self.storage, Storage::Contiguous(buffer));
        if let Storage::Chunked(blocks) = old {
            self.manager.release_blocks(blocks);
        }
    }

    /// Copies `data` into storage starting at byte offset `at`. The range
    /// must already be within capacity.
    fn write_at(&mut self, data: &[u8], at: usize) {
        match &mut self.storage {
            Storage::Contiguous(buffer) => {
                buffer.as_mut_slice()[at..at + data.len()].copy_from_slice(data);
            }
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                let mut offset = at;
                let mut remaining = data;
                while !remaining.is_empty() {
                    let index = offset / block_size;
                    let within = offset % block_size;
                    let take = (block_size - within).min(remaining.len());
                    blocks[index].as_mut_slice()[within..within + take]
                        .copy_from_slice(&remaining[..take]);
                    offset += take;
                    remaining = &remaining[take..];
                }
            }
        }
    }

    /// Copies `out.len()` bytes starting at byte offset `at` into `out`. The
    /// range must already be within the stream length.
    fn read_at(&self, out: &mut [u8], at: usize) {
        debug_assert!(at + out.len() <= self.length);
        match &self.storage {
            Storage::Contiguous(buffer) => {
                out.copy_from_slice(&buffer.as_slice()[at..at + out.len()]);
            }
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                let mut offset = at;
                let mut filled = 0;
                while filled < out.len() {
                    let index = offset / block_size;
                    let within = offset % block_size;
                    let take = (block_size - within).min(out.len() - filled);
                    out[filled..filled + take]
                        .copy_from_slice(&blocks[index].as_slice()[within..within + take]);
                    offset += take;
                    filled += take;
                }
            }
        }
    }

    /// Returns all owned storage to the pool, at most once.
    fn release_storage(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        match mem::replace(&mut self.storage, Storage::Chunked(Vec::new())) {
            Storage::Contiguous(buffer) => self.manager.release_large(buffer),
            Storage::Chunked(blocks) => self.manager.release_blocks(blocks),
        }
        for buffer in mem::take(&mut self.dirty) {
            self.manager.release_large(buffer);
        }
    }
}

impl Drop for PooledStream {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        warn!(
            id = %self.id,
            tag = ?self.tag,
            length = self.length,
            "stream dropped without dispose"
        );
        self.manager.note_stream_finalized(self.length);
        self.release_storage();
    }
}

impl fmt::Debug for PooledStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStream")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("length", &self.length)
            .field("position", &self.position)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

impl io::Write for PooledStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        PooledStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for PooledStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(PooledStream::read(self, buf))
    }
}

impl io::Seek for PooledStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(PooledStream::seek(self, pos)? as u64)
    }
}

impl Buf for PooledStream {
    fn remaining(&self) -> usize {
        self.length.saturating_sub(self.position)
    }

    fn chunk(&self) -> &[u8] {
        if self.position >= self.length {
            return &[];
        }
        match &self.storage {
            Storage::Contiguous(buffer) => &buffer.as_slice()[self.position..self.length],
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                let index = self.position / block_size;
                let within = self.position % block_size;
                let run = block_size.min(self.length - index * block_size);
                &blocks[index].as_slice()[within..run]
            }
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "cannot advance past the end of the stream"
        );
        self.position += cnt;
    }
}

// Storage bytes within capacity are always initialized (fresh buffers are
// zeroed, recycled ones hold their previous content), so handing out the
// capacity tail as a write target is sound.
unsafe impl BufMut for PooledStream {
    fn remaining_mut(&self) -> usize {
        let max = self.manager.config().maximum_stream_capacity;
        if max == 0 {
            (isize::MAX as usize).saturating_sub(self.position)
        } else {
            max.saturating_sub(self.position)
        }
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        let end = self.position + cnt;
        assert!(
            end <= self.capacity(),
            "cannot advance past the stream capacity"
        );
        self.position = end;
        if end > self.length {
            self.length = end;
        }
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        if self.position >= self.capacity() {
            let grown = self.ensure_capacity(self.position + 1);
            assert!(grown.is_ok(), "cannot grow past the maximum stream capacity");
        }
        let position = self.position;
        match &mut self.storage {
            Storage::Contiguous(buffer) => {
                UninitSlice::new(&mut buffer.as_mut_slice()[position..])
            }
            Storage::Chunked(blocks) => {
                let block_size = self.manager.config().block_size;
                let index = position / block_size;
                let within = position % block_size;
                UninitSlice::new(&mut blocks[index].as_mut_slice()[within..])
            }
        }
    }
}
