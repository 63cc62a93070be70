//! Purpose: Sequential writer/reader bound to element byte ranges in the queue.
//! Exports: `ElementOutputStream`, `ElementInputStream`.
//! Role: The only append path and the only payload read path of the queue.
//! Invariants: An element header is written lazily with zero length before its
//! first payload byte and patched to the true length when the element ends, so
//! a header never claims bytes that were not written after it.
//! Invariants: Appends become visible in one header commit at `close`; a
//! dropped stream leaves the queue observably unchanged.

use std::io;

use tracing::warn;

use crate::core::element::Element;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, ELEMENT_HEADER_LENGTH, QUEUE_HEADER_LENGTH};
use crate::core::queue::Queue;
use crate::core::storage::QueueStorage;

/// Writes one or more elements at the tail of the queue. Call `next` to finish
/// the element in progress and start another; `close` finishes the last
/// element and commits everything written through this stream atomically.
pub struct ElementOutputStream<'a, S: QueueStorage> {
    queue: &'a mut Queue<S>,
    /// Wrapped write cursor.
    position: u64,
    /// Element currently accumulating payload bytes.
    current: Element,
    /// Last finished element of this stream.
    new_last: Element,
    /// First element of this stream iff the queue was empty when it started.
    new_first: Element,
    elements_written: u32,
    /// Bytes this stream has claimed from the file, headers included.
    stream_bytes_used: u64,
    committed: bool,
    failed: bool,
}

impl<'a, S: QueueStorage> ElementOutputStream<'a, S> {
    pub(crate) fn new(queue: &'a mut Queue<S>, position: u64) -> Self {
        let position = queue.storage().wrap_position(position);
        Self {
            queue,
            position,
            current: Element::new(position, 0),
            new_last: Element::default(),
            new_first: Element::default(),
            elements_written: 0,
            stream_bytes_used: 0,
            committed: false,
            failed: false,
        }
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.failed {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("output stream failed; close it and open a new one"));
        }
        if self.queue.storage().is_closed() {
            return Err(Error::new(ErrorKind::Usage).with_message("storage is closed"));
        }
        Ok(())
    }

    /// Append payload bytes to the element in progress.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_writable()?;

        if self.current.is_empty() {
            // First byte of a new element: claim space for header and payload,
            // then put down a zero-length header to be patched on finish.
            self.ensure_capacity(ELEMENT_HEADER_LENGTH + bytes.len() as u64)?;
            let header = Element::new(self.current.position, 0);
            self.position = self
                .queue
                .storage_mut()
                .write(self.current.position, &header.encode_header(), false)?;
        } else {
            self.ensure_capacity(bytes.len() as u64)?;
        }

        self.position = self.queue.storage_mut().write(self.position, bytes, false)?;
        self.current.length += bytes.len() as u32;
        Ok(())
    }

    /// Finish the element in progress and position the stream for the next
    /// one. Elements with no payload are skipped entirely, so writing at least
    /// one byte is what creates an element.
    pub fn next(&mut self) -> Result<(), Error> {
        self.check_writable()?;
        if self.current.is_empty() {
            return Ok(());
        }

        self.new_last = self.current;
        if self.new_first.is_empty() && self.queue.is_empty() {
            self.new_first = self.current;
        }
        self.current = Element::new(self.position, 0);

        // Patch the real length and checksum over the zero header. The hint
        // lets a buffering storage keep its in-flight run untouched.
        self.queue
            .storage_mut()
            .write(self.new_last.position, &self.new_last.encode_header(), true)?;
        self.elements_written += 1;
        Ok(())
    }

    /// Bytes of the file in use once this stream commits.
    pub fn used_size(&self) -> u64 {
        self.queue.used_bytes() + self.stream_bytes_used
    }

    /// Claim `additional` bytes, growing the file if the claim no longer
    /// fits. Fails with `Full` before anything is written when even the
    /// maximum file size cannot hold the claim; the element in progress is
    /// abandoned and the stream refuses further writes, but elements already
    /// finished still commit on `close`.
    fn ensure_capacity(&mut self, additional: u64) -> Result<(), Error> {
        let new_stream_bytes = self.stream_bytes_used + additional;
        let bytes_needed = self.queue.used_bytes() + new_stream_bytes;
        let maximum = self.queue.maximum_file_size();

        let old_length = self.queue.file_size();
        let first_position = if !self.new_first.is_empty() {
            self.new_first.position
        } else {
            self.queue.first_position()
        };
        let wrapped = self.position <= first_position;

        if bytes_needed > maximum {
            self.current.length = 0;
            self.failed = true;
            return Err(Error::new(ErrorKind::Full)
                .with_message(format!("data does not fit in queue (needs {bytes_needed} of {maximum} bytes)")));
        }

        self.stream_bytes_used = new_stream_bytes;
        if bytes_needed <= old_length {
            return Ok(());
        }

        // Double the file length until the claim fits, capped at the maximum.
        let mut new_length = old_length;
        while new_length < bytes_needed {
            new_length = (new_length * 2).min(maximum);
        }
        if wrapped {
            // Compaction copies the wrapped run [header end, cursor) past the
            // old end of file; the capped length must leave room for it.
            let compacted_extent = old_length + self.position - QUEUE_HEADER_LENGTH;
            if new_length < compacted_extent {
                self.current.length = 0;
                self.failed = true;
                return Err(Error::new(ErrorKind::Full)
                    .with_message("growth cannot unwrap the queue within the maximum file size"));
            }
        }

        self.queue
            .grow_storage(new_length, self.position, first_position)?;

        if wrapped {
            // The wrapped run moved forward; follow it.
            let delta = old_length - QUEUE_HEADER_LENGTH;
            if self.current.position <= first_position {
                self.current.position += delta;
            }
            self.position += delta;
        }
        Ok(())
    }

    /// Finish the element in progress and commit every element written
    /// through this stream in one header write.
    pub fn close(mut self) -> Result<(), Error> {
        let result = self.finish();
        self.committed = true;
        result
    }

    fn finish(&mut self) -> Result<(), Error> {
        // After a capacity failure the element in progress is already
        // abandoned; elements finished before the failure still commit.
        if !self.failed {
            self.next()?;
        }
        self.queue.storage_mut().flush()?;
        if self.elements_written > 0 {
            self.queue
                .commit_elements(self.new_first, self.new_last, self.elements_written)?;
        }
        Ok(())
    }
}

impl<S: QueueStorage> Drop for ElementOutputStream<'_, S> {
    fn drop(&mut self) {
        if !self.committed && (self.elements_written > 0 || !self.current.is_empty()) {
            warn!(
                elements = self.elements_written,
                "output stream dropped without close; written elements are abandoned"
            );
        }
    }
}

impl<S: QueueStorage> io::Write for ElementOutputStream<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ElementOutputStream::write(self, buf)
            .map(|()| buf.len())
            .map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.queue.storage_mut().flush().map_err(io::Error::other)
    }
}

/// Reads the payload of exactly one element. Reads never cross into the next
/// element; the end of the payload reads as end-of-stream.
#[derive(Debug)]
pub struct ElementInputStream<'a, S: QueueStorage> {
    queue: &'a mut Queue<S>,
    expected_epoch: u64,
    /// Wrapped read cursor within the payload.
    position: u64,
    total_length: u32,
    bytes_read: u32,
}

impl<'a, S: QueueStorage> ElementInputStream<'a, S> {
    pub(crate) fn new(queue: &'a mut Queue<S>, element: Element) -> Self {
        let position = format::wrap_position(element.data_position(), queue.file_size());
        let expected_epoch = queue.epoch();
        Self {
            queue,
            expected_epoch,
            position,
            total_length: element.length,
            bytes_read: 0,
        }
    }

    /// Payload bytes not yet read.
    pub fn available(&self) -> usize {
        (self.total_length - self.bytes_read) as usize
    }

    /// Advance past up to `count` bytes without reading them; returns how many
    /// were skipped.
    pub fn skip(&mut self, count: usize) -> usize {
        let skipped = count.min(self.available());
        self.bytes_read += skipped as u32;
        self.position = self
            .queue
            .storage()
            .wrap_position(self.position + skipped as u64);
        skipped
    }

    /// Read up to `buf.len()` payload bytes; returns 0 at the element end.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() || self.available() == 0 {
            return Ok(0);
        }
        if self.queue.epoch() != self.expected_epoch {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("queue modified while reading an element"));
        }

        let count = buf.len().min(self.available());
        self.position = self
            .queue
            .storage_mut()
            .read(self.position, &mut buf[..count])?;
        self.bytes_read += count as u32;
        Ok(count)
    }

    /// Read the remaining payload into one buffer.
    pub fn read_remaining(&mut self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; self.available()];
        let mut filled = 0;
        while filled < buf.len() {
            let count = self.read(&mut buf[filled..])?;
            if count == 0 {
                break;
            }
            filled += count;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<S: QueueStorage> io::Read for ElementInputStream<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        ElementInputStream::read(self, buf).map_err(io::Error::other)
    }
}
