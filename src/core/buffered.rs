//! Purpose: Block-aligned buffering decorator over any `QueueStorage`.
//! Exports: `BufferedStorage`.
//! Role: Coalesce small writes into one filesystem block and serve repeated
//! small reads from memory, deferring I/O until a flush point.
//! Invariants: The buffer is in exactly one state: empty, dirty from a
//! contiguous write run, or clean holding read bytes.
//! Invariants: A dirty buffer is flushed before any read is served, so reads
//! always observe earlier writes.
//! Invariants: Queue header writes bypass the buffer; they must be durable in
//! place and never mix with buffered element bytes.

use crate::core::error::{Error, ErrorKind};
use crate::core::format::QUEUE_HEADER_LENGTH;
use crate::core::storage::QueueStorage;

/// One filesystem block; the largest unit the decorator coalesces.
pub const BLOCK_SIZE: usize = 8192;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BufferStatus {
    /// Nothing cached.
    Initial,
    /// Dirty: holds a contiguous write run starting at the buffer start.
    Write,
    /// Clean: holds bytes read from (or just flushed to) the backing storage.
    Read,
}

#[derive(Debug)]
struct BlockBuffer {
    data: Box<[u8]>,
    /// Storage position of `data[0]`.
    start: u64,
    /// Append cursor while writing; unused in the read state.
    cursor: usize,
    /// Valid window size: writable span while writing, valid bytes while reading.
    window: usize,
    status: BufferStatus,
}

impl BlockBuffer {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
            start: 0,
            cursor: 0,
            window: 0,
            status: BufferStatus::Initial,
        }
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn initialize(&mut self, start: u64, window: usize, status: BufferStatus) {
        self.start = start;
        self.cursor = 0;
        self.window = window;
        self.status = status;
    }

    fn reset(&mut self) {
        self.initialize(0, 0, BufferStatus::Initial);
    }

    /// Whether a write at `position` lands inside or directly appends to the
    /// current dirty run.
    fn is_writable(&self, position: u64) -> bool {
        position >= self.start && position <= self.start + self.cursor as u64
    }

    /// Whether a read at `position` can be served from the valid window.
    fn contains(&self, position: u64) -> bool {
        position >= self.start && position < self.start + self.window as u64
    }
}

#[derive(Debug)]
pub struct BufferedStorage<S: QueueStorage> {
    storage: S,
    buffer: BlockBuffer,
}

impl<S: QueueStorage> BufferedStorage<S> {
    pub fn new(storage: S) -> Self {
        Self::with_block_size(storage, BLOCK_SIZE)
    }

    pub fn with_block_size(storage: S, block_size: usize) -> Self {
        Self {
            storage,
            buffer: BlockBuffer::new(block_size),
        }
    }

    pub fn into_inner(self) -> S {
        self.storage
    }

    /// Write back the dirty run, if any. A flushed buffer keeps its bytes and
    /// can serve reads for them; an untouched one returns to empty.
    fn flush_buffer(&mut self) -> Result<(), Error> {
        if self.buffer.status != BufferStatus::Write {
            return Ok(());
        }
        if self.buffer.cursor == 0 {
            self.buffer.status = BufferStatus::Initial;
            return Ok(());
        }
        let start = self.buffer.start;
        let cursor = self.buffer.cursor;
        self.storage.write(start, &self.buffer.data[..cursor], false)?;
        self.buffer.window = cursor;
        self.buffer.cursor = 0;
        self.buffer.status = BufferStatus::Read;
        Ok(())
    }

    fn clear_buffer(&mut self) -> Result<(), Error> {
        self.flush_buffer()?;
        self.buffer.reset();
        Ok(())
    }

    /// Size of the writable window for a buffer anchored at `start`.
    fn window_at(&self, start: u64) -> usize {
        let remaining = self.storage.length().saturating_sub(start);
        (remaining as usize).min(self.buffer.capacity())
    }

    /// Write as much of `data` as the buffer allows; returns the wrapped
    /// position after the consumed bytes along with how many were consumed.
    fn write_some(
        &mut self,
        position: u64,
        data: &[u8],
        may_ignore_buffer: bool,
    ) -> Result<(u64, usize), Error> {
        // Large writes skip buffering entirely.
        if data.len() > self.buffer.capacity() {
            self.flush_buffer()?;
            let end = self.storage.write(position, data, false)?;
            return Ok((end, data.len()));
        }
        // Header writes must be immediately durable in place.
        if position < QUEUE_HEADER_LENGTH {
            let end = self.storage.write(position, data, false)?;
            return Ok((end, data.len()));
        }

        if self.buffer.status != BufferStatus::Write {
            let window = self.window_at(position);
            self.buffer.initialize(position, window, BufferStatus::Write);
        } else if !self.buffer.is_writable(position) || self.buffer.cursor == self.buffer.window {
            if may_ignore_buffer {
                // Patch writes go straight to storage so the in-flight run can
                // continue from its mark; flush first only if the patch ends
                // inside the dirty run and would otherwise be overwritten.
                let end_position = self
                    .storage
                    .wrap_position(position + data.len() as u64 - 1);
                if self.buffer.is_writable(end_position) {
                    self.flush_buffer()?;
                }
                let end = self.storage.write(position, data, false)?;
                return Ok((end, data.len()));
            }
            self.flush_buffer()?;
            let window = self.window_at(position);
            self.buffer.initialize(position, window, BufferStatus::Write);
        }

        let offset = (position - self.buffer.start) as usize;
        let count = data.len().min(self.buffer.window - offset);
        self.buffer.data[offset..offset + count].copy_from_slice(&data[..count]);
        // An interior overwrite must not pull the append cursor backwards.
        self.buffer.cursor = self.buffer.cursor.max(offset + count);
        let end = self
            .storage
            .wrap_position(self.buffer.start + (offset + count) as u64);
        Ok((end, count))
    }

    /// Serve as much of the read as one buffer window allows.
    fn read_some(&mut self, position: u64, data: &mut [u8]) -> Result<(u64, usize), Error> {
        if self.buffer.status == BufferStatus::Write {
            // Read-your-writes: nothing may be served while the buffer is dirty.
            self.flush_buffer()?;
            self.storage.flush()?;
        }
        if self.buffer.status != BufferStatus::Read || !self.buffer.contains(position) {
            // Reads at least a block long gain nothing from caching.
            if data.len() >= self.buffer.capacity() {
                let end = self.storage.read(position, data)?;
                return Ok((end, data.len()));
            }
            let block = self.buffer.capacity() as u64;
            let aligned = position / block * block;
            let data_capacity = self.storage.length() - QUEUE_HEADER_LENGTH;
            let window = (self.window_at(aligned)).min(data_capacity as usize);
            if (position - aligned) as usize >= window {
                // A window anchored at the block boundary cannot cover this
                // position (tiny file tail); bypass the buffer.
                let end = self.storage.read(position, data)?;
                return Ok((end, data.len()));
            }
            self.buffer.initialize(aligned, window, BufferStatus::Read);
            let fill = &mut self.buffer.data[..window];
            self.storage.read(aligned, fill)?;
        }

        let offset = (position - self.buffer.start) as usize;
        let count = data.len().min(self.buffer.window - offset);
        data[..count].copy_from_slice(&self.buffer.data[offset..offset + count]);
        let end = self.storage.wrap_position(position + count as u64);
        Ok((end, count))
    }
}

impl<S: QueueStorage> QueueStorage for BufferedStorage<S> {
    fn length(&self) -> u64 {
        self.storage.length()
    }

    fn minimum_length(&self) -> u64 {
        self.storage.minimum_length()
    }

    fn maximum_length(&self) -> u64 {
        self.storage.maximum_length()
    }

    fn set_maximum_length(&mut self, value: u64) -> Result<(), Error> {
        self.storage.set_maximum_length(value)
    }

    fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    fn is_pre_existing(&self) -> bool {
        self.storage.is_pre_existing()
    }

    fn write(&mut self, position: u64, data: &[u8], may_ignore_buffer: bool) -> Result<u64, Error> {
        let data_capacity = self.storage.length().saturating_sub(QUEUE_HEADER_LENGTH);
        if data.len() as u64 > data_capacity {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "write of {} bytes exceeds storage capacity {data_capacity}",
                data.len()
            )));
        }
        let mut position = position;
        let mut remaining = data;
        loop {
            let (end, consumed) = self.write_some(position, remaining, may_ignore_buffer)?;
            position = end;
            if consumed == remaining.len() {
                return Ok(position);
            }
            remaining = &remaining[consumed..];
        }
    }

    fn read(&mut self, position: u64, data: &mut [u8]) -> Result<u64, Error> {
        if position >= self.storage.length() {
            return Err(Error::new(ErrorKind::Usage)
                .with_offset(position)
                .with_message(format!(
                    "position {position} out of range [0, {})",
                    self.storage.length()
                )));
        }
        let mut position = position;
        let mut filled = 0;
        while filled < data.len() {
            let (end, count) = self.read_some(position, &mut data[filled..])?;
            position = end;
            filled += count;
        }
        Ok(position)
    }

    fn move_region(&mut self, src: u64, dst: u64, count: u64) -> Result<(), Error> {
        // The copy changes the position-to-content mapping the buffer assumes.
        self.clear_buffer()?;
        self.storage.move_region(src, dst, count)
    }

    fn resize(&mut self, size: u64) -> Result<(), Error> {
        self.clear_buffer()?;
        self.storage.resize(size)
    }

    fn wrap_position(&self, position: u64) -> u64 {
        self.storage.wrap_position(position)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.flush_buffer()?;
        self.storage.flush()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.flush_buffer()?;
        self.storage.close()
    }
}
