//! Purpose: Define the storage contract the queue runs against.
//! Exports: `QueueStorage`.
//! Role: Seam between queue bookkeeping and physical byte storage, so the
//! buffering decorator composes transparently and tests can run in memory.
//! Invariants: Data lives in `[QUEUE_HEADER_LENGTH, length)`; reads and writes
//! wrap past the end of the storage back to the end of the header region.

use crate::core::error::Error;

/// Byte-addressable, wraparound-aware storage of a bounded, resizable region.
///
/// Implementations must write data contiguously from the caller's point of
/// view: a write or read that would run past the end of the storage continues
/// directly after the header region. All operations are blocking; nothing is
/// deferred except as documented by a buffering implementation, and `flush`
/// makes any such deferred bytes durable.
pub trait QueueStorage {
    /// Current size of the storage in bytes, header included.
    fn length(&self) -> u64;

    /// Smallest size the storage may be resized to.
    fn minimum_length(&self) -> u64;

    /// Largest size the storage may grow to.
    fn maximum_length(&self) -> u64;

    /// Raise or lower the growth ceiling. Values below the minimum length are
    /// clamped up; values beyond the addressable range are a usage error.
    fn set_maximum_length(&mut self, value: u64) -> Result<(), Error>;

    /// Whether `close` was called.
    fn is_closed(&self) -> bool;

    /// Whether the underlying file existed before this storage was created.
    fn is_pre_existing(&self) -> bool;

    /// Write all of `data` starting at the wrapped `position` and return the
    /// wrapped position immediately after the write. `may_ignore_buffer` hints
    /// that the caller is patching a region it has already written and the
    /// write may go straight to the backing file if honoring it through a
    /// buffer would disturb buffered state.
    fn write(&mut self, position: u64, data: &[u8], may_ignore_buffer: bool) -> Result<u64, Error>;

    /// Fill `data` completely from the wrapped `position` and return the
    /// wrapped end position. A short read means the file is truncated and is
    /// reported as corruption.
    fn read(&mut self, position: u64, data: &mut [u8]) -> Result<u64, Error>;

    /// Copy `count` bytes from one region to another. Used only during
    /// compaction; the copy is fully buffered so overlapping regions are safe.
    fn move_region(&mut self, src: u64, dst: u64, count: u64) -> Result<(), Error>;

    /// Grow or shrink the storage. Shrinking below live data is a caller
    /// error the queue must rule out beforehand; growing past the maximum
    /// length fails.
    fn resize(&mut self, size: u64) -> Result<(), Error>;

    /// Map a virtual position into the valid range; see `format::wrap_position`.
    fn wrap_position(&self, position: u64) -> u64;

    fn flush(&mut self) -> Result<(), Error>;

    fn close(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod testing {
    // In-memory storage double so queue logic is testable without a filesystem.
    use crate::core::error::{Error, ErrorKind};
    use crate::core::format::{self, QUEUE_HEADER_LENGTH};
    use crate::core::storage::QueueStorage;

    #[derive(Debug)]
    pub struct MemoryStorage {
        data: Vec<u8>,
        minimum_length: u64,
        maximum_length: u64,
        closed: bool,
        pre_existing: bool,
    }

    impl MemoryStorage {
        pub fn new(initial_length: u64, maximum_length: u64) -> Self {
            Self {
                data: vec![0; initial_length as usize],
                minimum_length: initial_length,
                maximum_length,
                closed: false,
                pre_existing: false,
            }
        }

        pub fn contents(&self) -> &[u8] {
            &self.data
        }

        pub fn corrupt_byte(&mut self, offset: u64) {
            let offset = offset as usize;
            self.data[offset] ^= 0xFF;
        }
    }

    impl QueueStorage for MemoryStorage {
        fn length(&self) -> u64 {
            self.data.len() as u64
        }

        fn minimum_length(&self) -> u64 {
            self.minimum_length
        }

        fn maximum_length(&self) -> u64 {
            self.maximum_length
        }

        fn set_maximum_length(&mut self, value: u64) -> Result<(), Error> {
            self.maximum_length = value.max(self.minimum_length);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn is_pre_existing(&self) -> bool {
            self.pre_existing
        }

        fn write(
            &mut self,
            position: u64,
            data: &[u8],
            _may_ignore_buffer: bool,
        ) -> Result<u64, Error> {
            let length = self.length();
            let wrapped = self.wrap_position(position);
            let count = data.len() as u64;
            if wrapped >= length {
                return Err(Error::new(ErrorKind::Usage).with_offset(position));
            }
            if wrapped + count <= length {
                let start = wrapped as usize;
                self.data[start..start + data.len()].copy_from_slice(data);
                Ok(self.wrap_position(wrapped + count))
            } else {
                let first = (length - wrapped) as usize;
                let start = wrapped as usize;
                self.data[start..].copy_from_slice(&data[..first]);
                let rest = data.len() - first;
                let header_end = QUEUE_HEADER_LENGTH as usize;
                self.data[header_end..header_end + rest].copy_from_slice(&data[first..]);
                Ok(QUEUE_HEADER_LENGTH + rest as u64)
            }
        }

        fn read(&mut self, position: u64, data: &mut [u8]) -> Result<u64, Error> {
            let length = self.length();
            let wrapped = self.wrap_position(position);
            let count = data.len() as u64;
            if wrapped >= length {
                return Err(Error::new(ErrorKind::Usage).with_offset(position));
            }
            if wrapped + count <= length {
                let start = wrapped as usize;
                data.copy_from_slice(&self.data[start..start + data.len()]);
                Ok(self.wrap_position(wrapped + count))
            } else {
                let first = (length - wrapped) as usize;
                let start = wrapped as usize;
                data[..first].copy_from_slice(&self.data[start..]);
                let rest = data.len() - first;
                let header_end = QUEUE_HEADER_LENGTH as usize;
                data[first..].copy_from_slice(&self.data[header_end..header_end + rest]);
                Ok(QUEUE_HEADER_LENGTH + rest as u64)
            }
        }

        fn move_region(&mut self, src: u64, dst: u64, count: u64) -> Result<(), Error> {
            let chunk = self.data[src as usize..(src + count) as usize].to_vec();
            self.data[dst as usize..(dst + count) as usize].copy_from_slice(&chunk);
            Ok(())
        }

        fn resize(&mut self, size: u64) -> Result<(), Error> {
            if size > self.length() && size > self.maximum_length {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(format!("new length {size} exceeds maximum")));
            }
            self.data.resize(size as usize, 0);
            Ok(())
        }

        fn wrap_position(&self, position: u64) -> u64 {
            format::wrap_position(position, self.length())
        }

        fn flush(&mut self) -> Result<(), Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), Error> {
            self.closed = true;
            Ok(())
        }
    }
}
