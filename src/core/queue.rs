//! Purpose: The file-backed FIFO queue: header plus element bookkeeping over storage.
//! Exports: `Queue`, `ElementIter`.
//! Role: Orchestrates append streams, peek, removal, growth, compaction, and
//! truncation while holding the crash-consistency protocol together.
//! Invariants: The header is written last in every mutating operation.
//! Invariants: Cached elements are exactly the leading elements of the queue,
//! oldest first, with positions kept current across compaction.
//! Invariants: A checksum mismatch closes the queue; recovery is the caller's
//! decision, never an automatic repair.

use std::collections::VecDeque;
use std::path::Path;

use tracing::{debug, error};

use crate::core::buffered::BufferedStorage;
use crate::core::direct::DirectFileStorage;
use crate::core::element::Element;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, ELEMENT_HEADER_LENGTH, MINIMUM_LENGTH, QUEUE_HEADER_LENGTH};
use crate::core::header::QueueHeader;
use crate::core::storage::QueueStorage;
use crate::core::stream::{ElementInputStream, ElementOutputStream};

/// A file-based FIFO of length-prefixed byte records. Additions and removals
/// are O(1) and synchronous: data reaches the file before an operation
/// returns, and an interrupted mutation is simply invisible because nothing
/// is committed until the final header write.
///
/// `peek` and `remove` are used in conjunction: peek the oldest element, and
/// remove it only after it was processed successfully. A crash between the
/// two leaves the element in the queue for the next run.
///
/// The queue performs no internal locking; exclusive access is enforced by
/// `&mut self` and by the storage-level file lock.
#[derive(Debug)]
pub struct Queue<S: QueueStorage> {
    storage: S,
    header: QueueHeader,
    /// The leading elements of the queue, oldest first.
    first_elements: VecDeque<Element>,
    /// The newest element, zero sentinel when empty.
    last: Element,
    /// Bumped on every structural mutation; iterators and input streams
    /// capture it and fail fast when it moves under them.
    epoch: u64,
}

impl Queue<BufferedStorage<DirectFileStorage>> {
    /// Open or create a queue file with block-buffered storage. This is the
    /// production configuration.
    pub fn open(path: impl AsRef<Path>, maximum_length: u64) -> Result<Self, Error> {
        let direct = DirectFileStorage::open(path, MINIMUM_LENGTH, maximum_length)?;
        Self::new(BufferedStorage::new(direct))
    }
}

impl Queue<DirectFileStorage> {
    /// Open or create a queue file with unbuffered storage. Every write goes
    /// straight to the file; useful when append batches are large already.
    pub fn open_direct(path: impl AsRef<Path>, maximum_length: u64) -> Result<Self, Error> {
        let direct = DirectFileStorage::open(path, MINIMUM_LENGTH, maximum_length)?;
        Self::new(direct)
    }
}

impl<S: QueueStorage> Queue<S> {
    /// Initialize a queue over the given storage, reading the header of a
    /// pre-existing file or writing a fresh one.
    pub fn new(mut storage: S) -> Result<Self, Error> {
        let header = if storage.is_pre_existing() {
            let header = QueueHeader::read(&mut storage)?;
            if header.length > storage.length() {
                return Err(Error::new(ErrorKind::Corrupt).with_message(format!(
                    "header claims {} bytes but file has {}",
                    header.length,
                    storage.length()
                )));
            }
            header
        } else {
            let header = QueueHeader::fresh(storage.length());
            header.write(&mut storage)?;
            header
        };

        // A crash between growing the file and committing the header leaves
        // the file longer than the header claims; cut it back.
        if header.length < storage.length() {
            storage.resize(header.length)?;
        }

        let mut queue = Self {
            storage,
            header,
            first_elements: VecDeque::new(),
            last: Element::default(),
            epoch: 0,
        };

        if queue.header.first_position != 0 {
            let position = queue.wrap(queue.header.first_position);
            let first = queue.read_element_at(position)?;
            if !first.is_empty() {
                queue.first_elements.push_back(first);
            }
        }
        queue.last = if queue.header.last_position != 0 {
            let position = queue.wrap(queue.header.last_position);
            queue.read_element_at(position)?
        } else {
            Element::default()
        };

        Ok(queue)
    }

    /// Number of elements in the queue.
    pub fn size(&self) -> usize {
        self.header.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    /// Current size of the backing file in bytes.
    pub fn file_size(&self) -> u64 {
        self.header.length
    }

    pub fn maximum_file_size(&self) -> u64 {
        self.storage.maximum_length()
    }

    pub fn set_maximum_file_size(&mut self, value: u64) -> Result<(), Error> {
        self.storage.set_maximum_length(value)
    }

    pub fn is_closed(&self) -> bool {
        self.storage.is_closed()
    }

    /// Bytes of the file in use, header included.
    pub fn used_bytes(&self) -> u64 {
        if self.is_empty() {
            return QUEUE_HEADER_LENGTH;
        }
        let first_position = match self.first_elements.front() {
            Some(element) => element.position,
            None => self.header.first_position,
        };
        if self.last.position >= first_position {
            // Contiguous span from first element to the end of the last.
            self.last.next_position() - first_position + QUEUE_HEADER_LENGTH
        } else {
            // The queue wraps; the gap between last and first is the free part.
            self.last.next_position() - first_position + self.header.length
        }
    }

    pub(crate) fn storage(&self) -> &S {
        &self.storage
    }

    pub(crate) fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn first_position(&self) -> u64 {
        self.header.first_position
    }

    fn wrap(&self, position: u64) -> u64 {
        format::wrap_position(position, self.header.length)
    }

    fn require_not_closed(&self) -> Result<(), Error> {
        if self.storage.is_closed() {
            return Err(Error::new(ErrorKind::Usage).with_message("queue storage is closed"));
        }
        Ok(())
    }

    /// Read and verify an element header. Position 0 is the empty sentinel.
    /// A checksum mismatch means the file is corrupt: the queue closes itself
    /// and surfaces the error; recreating the file is up to the caller.
    fn read_element_at(&mut self, position: u64) -> Result<Element, Error> {
        if position == 0 {
            return Ok(Element::default());
        }
        let mut buf = [0u8; ELEMENT_HEADER_LENGTH as usize];
        self.storage.read(position, &mut buf)?;
        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let stored_crc = buf[4];

        let element = Element::new(position, length);
        if stored_crc != element.crc() {
            error!(
                position,
                length, stored_crc, "element checksum mismatch; queue file is corrupt"
            );
            let _ = self.storage.close();
            return Err(Error::new(ErrorKind::Corrupt)
                .with_offset(position)
                .with_message("element header checksum mismatch"));
        }
        Ok(element)
    }

    /// The oldest element, reading it from the file if the cache was never
    /// populated.
    fn first_element(&mut self) -> Result<Element, Error> {
        if let Some(element) = self.first_elements.front() {
            return Ok(*element);
        }
        let position = self.wrap(self.header.first_position);
        let element = self.read_element_at(position)?;
        self.first_elements.push_back(element);
        Ok(element)
    }

    /// Open an append stream positioned after the newest element. Elements
    /// written through the stream become visible atomically when it is closed.
    pub fn element_output_stream(&mut self) -> Result<ElementOutputStream<'_, S>, Error> {
        self.require_not_closed()?;
        let position = self.last.next_position();
        Ok(ElementOutputStream::new(self, position))
    }

    /// Stream over the oldest element without removing it, or `None` if the
    /// queue is empty.
    pub fn peek(&mut self) -> Result<Option<ElementInputStream<'_, S>>, Error> {
        self.require_not_closed()?;
        if self.is_empty() {
            return Ok(None);
        }
        let element = self.first_element()?;
        Ok(Some(ElementInputStream::new(self, element)))
    }

    /// Iterate the queued elements oldest-first. The iterator fails fast if
    /// the queue is structurally modified while it is alive.
    pub fn iter(&mut self) -> ElementIter<'_, S> {
        ElementIter {
            expected_epoch: self.epoch,
            next_index: 0,
            queue: self,
        }
    }

    /// Remove the `n` oldest elements. Removing every element degenerates to
    /// `clear`; removing more than present is a usage error.
    pub fn remove(&mut self, n: usize) -> Result<(), Error> {
        self.require_not_closed()?;
        let count = self.header.count as usize;
        if n == 0 {
            return Ok(());
        }
        if n == count {
            return self.clear();
        }
        if n > count {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "cannot remove more elements ({n}) than present in queue ({count})"
            )));
        }

        let mut new_first = Element::default();
        let mut skipped = 0;
        while skipped < n {
            match self.first_elements.pop_front() {
                Some(element) => {
                    new_first = element;
                    skipped += 1;
                }
                None => break,
            }
        }

        if self.first_elements.is_empty() {
            // The cache ran out; walk the chain on disk, reading one extra
            // element to become the new cached first.
            while skipped <= n {
                let position = self.wrap(new_first.next_position());
                new_first = self.read_element_at(position)?;
                skipped += 1;
            }
            self.first_elements.push_back(new_first);
        } else if let Some(front) = self.first_elements.front() {
            new_first = *front;
        }

        self.epoch += 1;
        self.header.first_position = new_first.position;
        self.header.count -= n as u32;
        self.truncate_if_needed()?;
        self.header.write(&mut self.storage)
    }

    /// Shrink the file when usage has dropped far enough and no live byte
    /// sits past the shrink point. Only removal ever shrinks the file.
    fn truncate_if_needed(&mut self) -> Result<(), Error> {
        if self.header.last_position < self.header.first_position
            || self.last.next_position() > self.maximum_file_size()
        {
            return Ok(());
        }
        let mut new_length = self.header.length;
        let mut goal = new_length / 2;
        let bytes_used = self.used_bytes();
        let max_extent = self.last.next_position();

        while goal >= self.storage.minimum_length() && max_extent <= goal && bytes_used <= goal / 2
        {
            new_length = goal;
            goal /= 2;
        }
        if new_length < self.header.length {
            debug!(
                from = self.header.length,
                to = new_length,
                "truncating queue file"
            );
            self.storage.resize(new_length)?;
            self.header.length = new_length;
        }
        Ok(())
    }

    /// Empty the queue and shrink the file back to its initial size.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.require_not_closed()?;

        self.first_elements.clear();
        self.last.reset();
        self.header.clear();

        if self.header.length != self.storage.minimum_length() {
            self.storage.resize(self.storage.minimum_length())?;
            self.header.length = self.storage.minimum_length();
        }
        self.header.write(&mut self.storage)?;
        self.epoch += 1;
        Ok(())
    }

    /// Commit elements appended through an output stream: update the tail,
    /// seed the head if the queue was empty, bump the count, write the header.
    pub(crate) fn commit_elements(
        &mut self,
        new_first: Element,
        new_last: Element,
        count: u32,
    ) -> Result<(), Error> {
        if !new_last.is_empty() {
            self.last = new_last;
            self.header.last_position = new_last.position;
        }
        if !new_first.is_empty() && self.first_elements.is_empty() {
            self.first_elements.push_back(new_first);
            self.header.first_position = new_first.position;
        }
        self.header.count += count;
        self.header.write(&mut self.storage)?;
        self.epoch += 1;
        Ok(())
    }

    /// Grow the file to `new_length`. When the live data wraps around the old
    /// end of file (`position <= first_position`), the wrapped run
    /// `[header end, position)` is copied to the old end so the ring stays
    /// contiguous, and every tracked position inside the run moves with it.
    pub(crate) fn grow_storage(
        &mut self,
        new_length: u64,
        position: u64,
        first_position: u64,
    ) -> Result<(), Error> {
        let old_length = self.header.length;
        if new_length < old_length {
            return Err(Error::new(ErrorKind::Usage).with_message("file length may not be decreased"));
        }
        if new_length > self.maximum_file_size() {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("file length may not exceed the maximum file size"));
        }
        if first_position >= old_length || position > old_length {
            return Err(Error::new(ErrorKind::Usage)
                .with_offset(position)
                .with_message("grow positions outside the current file"));
        }

        debug!(from = old_length, to = new_length, "extending queue file");
        self.storage.resize(new_length)?;
        self.header.length = new_length;

        if position <= first_position {
            if position > QUEUE_HEADER_LENGTH {
                let count = position - QUEUE_HEADER_LENGTH;
                self.storage
                    .move_region(QUEUE_HEADER_LENGTH, old_length, count)?;
            }
            self.epoch += 1;

            let delta = old_length - QUEUE_HEADER_LENGTH;
            if self.header.last_position < first_position {
                self.header.last_position += delta;
                self.last.position = self.header.last_position;
            }
            for element in &mut self.first_elements {
                if element.position < first_position {
                    element.position += delta;
                }
            }
        }

        self.header.write(&mut self.storage)
    }

    /// Close the underlying storage. Further operations fail; the file keeps
    /// whatever was last committed.
    pub fn close(&mut self) -> Result<(), Error> {
        self.storage.close()
    }
}

/// Oldest-first iterator handing out one input stream at a time.
pub struct ElementIter<'a, S: QueueStorage> {
    queue: &'a mut Queue<S>,
    next_index: usize,
    expected_epoch: u64,
}

impl<S: QueueStorage> ElementIter<'_, S> {
    fn check_conditions(&self) -> Result<(), Error> {
        if self.queue.storage.is_closed() {
            return Err(Error::new(ErrorKind::Usage).with_message("queue storage is closed"));
        }
        if self.queue.epoch != self.expected_epoch {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("queue structurally modified during iteration"));
        }
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.next_index < self.queue.header.count as usize
    }

    /// Stream over the next element, or `None` past the last one.
    pub fn next_stream(&mut self) -> Result<Option<ElementInputStream<'_, S>>, Error> {
        self.check_conditions()?;
        if !self.has_next() {
            return Ok(None);
        }

        let element = if self.next_index < self.queue.first_elements.len() {
            self.queue.first_elements[self.next_index]
        } else {
            // Extend the cache by following the chain from its last entry.
            let previous = match self.queue.first_elements.back() {
                Some(element) => *element,
                None => Element::default(),
            };
            let position = self.queue.wrap(previous.next_position());
            let element = self.queue.read_element_at(position)?;
            self.queue.first_elements.push_back(element);
            element
        };

        self.next_index += 1;
        Ok(Some(ElementInputStream::new(self.queue, element)))
    }
}

#[cfg(test)]
mod tests {
    use super::Queue;
    use crate::core::error::ErrorKind;
    use crate::core::format::{ELEMENT_HEADER_LENGTH, MINIMUM_LENGTH, QUEUE_HEADER_LENGTH};
    use crate::core::storage::testing::MemoryStorage;

    fn memory_queue(max_blocks: u64) -> Queue<MemoryStorage> {
        let storage = MemoryStorage::new(MINIMUM_LENGTH, MINIMUM_LENGTH * max_blocks);
        Queue::new(storage).expect("queue")
    }

    fn append(queue: &mut Queue<MemoryStorage>, payloads: &[&[u8]]) {
        let mut out = queue.element_output_stream().expect("stream");
        for payload in payloads {
            out.write(payload).expect("write");
            out.next().expect("next");
        }
        out.close().expect("close");
    }

    fn read_all(queue: &mut Queue<MemoryStorage>) -> Vec<Vec<u8>> {
        let mut results = Vec::new();
        let mut iter = queue.iter();
        while let Some(mut stream) = iter.next_stream().expect("next") {
            results.push(stream.read_remaining().expect("read"));
        }
        results
    }

    #[test]
    fn starts_empty() {
        let mut queue = memory_queue(8);
        assert!(queue.is_empty());
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.used_bytes(), QUEUE_HEADER_LENGTH);
        assert!(queue.peek().expect("peek").is_none());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"alpha", b"beta", b"gamma"]);
        assert_eq!(queue.size(), 3);
        assert_eq!(
            read_all(&mut queue),
            vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
        );

        queue.remove(1).expect("remove");
        assert_eq!(
            read_all(&mut queue),
            vec![b"beta".to_vec(), b"gamma".to_vec()]
        );
    }

    #[test]
    fn peek_does_not_remove() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"only"]);
        for _ in 0..2 {
            let mut stream = queue.peek().expect("peek").expect("element");
            assert_eq!(stream.available(), 4);
            assert_eq!(stream.read_remaining().expect("read"), b"only");
        }
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn empty_remove_and_clear_are_noops() {
        let mut queue = memory_queue(8);
        queue.remove(0).expect("remove zero");
        queue.clear().expect("clear empty");
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.file_size(), MINIMUM_LENGTH);
        assert_eq!(queue.used_bytes(), QUEUE_HEADER_LENGTH);
    }

    #[test]
    fn removing_more_than_present_is_a_usage_error() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"a", b"b"]);
        let err = queue.remove(3).expect_err("too many");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn removing_all_clears_the_queue() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"a", b"b", b"c"]);
        queue.remove(3).expect("remove all");
        assert!(queue.is_empty());
        assert_eq!(queue.file_size(), MINIMUM_LENGTH);
    }

    #[test]
    fn multi_element_stream_commits_atomically() {
        let mut queue = memory_queue(8);
        let mut out = queue.element_output_stream().expect("stream");
        out.write(b"one").expect("write");
        out.next().expect("next");
        out.write(b"two").expect("write");
        // Not yet committed.
        assert_eq!(out.used_size(), QUEUE_HEADER_LENGTH + 2 * 5 + 6);
        out.close().expect("close");
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn abandoned_stream_leaves_queue_unchanged() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"keep"]);
        {
            let mut out = queue.element_output_stream().expect("stream");
            out.write(b"discard me").expect("write");
            out.next().expect("next");
            // Dropped without close.
        }
        assert_eq!(queue.size(), 1);
        assert_eq!(read_all(&mut queue), vec![b"keep".to_vec()]);
    }

    #[test]
    fn zero_length_write_creates_no_element() {
        let mut queue = memory_queue(8);
        let mut out = queue.element_output_stream().expect("stream");
        out.write(b"").expect("empty write");
        out.next().expect("next");
        out.close().expect("close");
        assert!(queue.is_empty());
    }

    #[test]
    fn iterator_fails_fast_after_modification() {
        let mut queue = memory_queue(8);
        append(&mut queue, &[b"a", b"b"]);
        // Bump the epoch between iterator creation and use.
        let epoch_before = queue.epoch;
        queue.remove(1).expect("remove");
        assert_ne!(queue.epoch, epoch_before);

        let mut iter = queue.iter();
        iter.expected_epoch = epoch_before;
        let err = iter.next_stream().expect_err("stale iterator");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn growth_preserves_elements_across_wraparound() {
        let mut queue = memory_queue(16);
        let payload = vec![0xA5u8; 600];
        // Fill most of the initial 4096 bytes.
        for _ in 0..6 {
            append(&mut queue, &[payload.as_slice()]);
        }
        // Free the front so the next appends wrap past the end of file.
        queue.remove(4).expect("remove");
        for _ in 0..3 {
            append(&mut queue, &[payload.as_slice()]);
        }
        // Growth happens while the data wraps, forcing compaction.
        for _ in 0..2 {
            append(&mut queue, &[payload.as_slice()]);
        }
        assert!(queue.file_size() > MINIMUM_LENGTH);
        let contents = read_all(&mut queue);
        assert_eq!(contents.len(), 7);
        assert!(contents.iter().all(|bytes| bytes == payload.as_slice()));
    }

    #[test]
    fn capacity_error_leaves_queue_usable() {
        let mut queue = memory_queue(1);
        let payload = vec![1u8; 2048];
        append(&mut queue, &[payload.as_slice()]);

        let mut out = queue.element_output_stream().expect("stream");
        let err = out.write(&payload).expect_err("full");
        assert_eq!(err.kind(), ErrorKind::Full);
        out.close().expect("close");

        assert_eq!(queue.size(), 1);
        append(&mut queue, &[b"tiny"]);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn corrupt_element_header_closes_the_queue() {
        let storage = MemoryStorage::new(MINIMUM_LENGTH, MINIMUM_LENGTH * 4);
        let mut queue = Queue::new(storage).expect("queue");
        append_bytes(&mut queue, b"sensor-sample");
        // Flip a byte inside the first element header.
        queue.storage.corrupt_byte(QUEUE_HEADER_LENGTH + 1);
        queue.first_elements.clear();

        let err = queue.peek().map(|_| ()).expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(queue.is_closed());
    }

    #[test]
    fn file_size_follows_doubling_schedule() {
        let mut queue = memory_queue(8);
        let payload_len = (MINIMUM_LENGTH / 2 - QUEUE_HEADER_LENGTH) as usize;
        let payload = vec![7u8; payload_len];
        let element = payload_len as u64 + ELEMENT_HEADER_LENGTH;

        let expected_sizes = [
            MINIMUM_LENGTH,
            MINIMUM_LENGTH,
            MINIMUM_LENGTH * 2,
            MINIMUM_LENGTH * 2,
            MINIMUM_LENGTH * 4,
            MINIMUM_LENGTH * 4,
            MINIMUM_LENGTH * 4,
            MINIMUM_LENGTH * 4,
        ];
        for (index, expected) in expected_sizes.iter().enumerate() {
            append(&mut queue, &[payload.as_slice()]);
            assert_eq!(queue.file_size(), *expected, "after append {index}");
            assert_eq!(
                queue.used_bytes(),
                element * (index as u64 + 1) + QUEUE_HEADER_LENGTH
            );
        }
    }

    #[test]
    fn truncation_shrinks_after_removal() {
        let mut queue = memory_queue(8);
        let payload = vec![3u8; (MINIMUM_LENGTH / 2) as usize];
        for _ in 0..6 {
            append(&mut queue, &[payload.as_slice()]);
        }
        assert_eq!(queue.file_size(), MINIMUM_LENGTH * 4);

        // Free the front, then append until the write position wraps so the
        // surviving element sits near the start of the file.
        queue.remove(5).expect("remove old");
        for _ in 0..3 {
            append(&mut queue, &[payload.as_slice()]);
        }
        queue.remove(3).expect("remove high");

        assert_eq!(queue.size(), 1);
        assert_eq!(queue.file_size(), MINIMUM_LENGTH * 2);
        let contents = read_all(&mut queue);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0], payload);
    }

    fn append_bytes(queue: &mut Queue<MemoryStorage>, payload: &[u8]) {
        let mut out = queue.element_output_stream().expect("stream");
        out.write(payload).expect("write");
        out.close().expect("close");
    }
}
