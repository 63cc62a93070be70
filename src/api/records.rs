//! Purpose: Typed record queue over the byte-level element queue.
//! Exports: `RecordQueue`, `Serializer`, `Deserializer`, JSON implementations, `PeekedRecords`.
//! Role: Serialize records into queue elements and read them back in FIFO
//! order, with bounded batch peeking for upload-sized drains.
//! Invariants: One record maps to one element; a batch added through
//! `add_all` commits atomically.
//! Invariants: An unreadable record is skipped with a warning but still
//! counted, so removal by element count stays aligned with the file.

use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

use crate::core::buffered::BufferedStorage;
use crate::core::direct::DirectFileStorage;
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::Queue;
use crate::core::storage::QueueStorage;

/// Turns a record into the payload bytes of one element.
pub trait Serializer<T> {
    fn serialize<W: Write>(&self, record: &T, out: W) -> Result<(), Error>;
}

/// Rebuilds a record from the payload bytes of one element.
pub trait Deserializer<T> {
    fn deserialize<R: Read>(&self, input: R) -> Result<T, Error>;
}

/// JSON payloads via serde.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl<T: Serialize> Serializer<T> for JsonSerializer {
    fn serialize<W: Write>(&self, record: &T, out: W) -> Result<(), Error> {
        serde_json::to_writer(out, record).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("cannot serialize record")
                .with_source(err)
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDeserializer;

impl<T: DeserializeOwned> Deserializer<T> for JsonDeserializer {
    fn deserialize<R: Read>(&self, input: R) -> Result<T, Error> {
        serde_json::from_reader(input).map_err(|err| {
            Error::new(ErrorKind::Corrupt)
                .with_message("cannot deserialize record")
                .with_source(err)
        })
    }
}

/// A timestamped sensor measurement, the canonical record shape buffered for
/// relay: which source produced it, when, and an arbitrary JSON payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub source_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub payload: serde_json::Value,
}

/// Result of a bounded peek: the readable records plus the number of elements
/// they span on disk. Remove `element_count` elements to drop the batch,
/// including any records that failed to deserialize.
#[derive(Debug)]
pub struct PeekedRecords<T> {
    pub records: Vec<T>,
    pub element_count: usize,
}

/// A FIFO of typed records backed by a queue file.
pub struct RecordQueue<T, Ser, De, S: QueueStorage> {
    queue: Queue<S>,
    serializer: Ser,
    deserializer: De,
    _record: PhantomData<fn() -> T>,
}

impl<T, Ser, De> RecordQueue<T, Ser, De, BufferedStorage<DirectFileStorage>>
where
    Ser: Serializer<T>,
    De: Deserializer<T>,
{
    /// Open or create a record queue file with the production storage stack.
    pub fn open(
        path: impl AsRef<Path>,
        maximum_length: u64,
        serializer: Ser,
        deserializer: De,
    ) -> Result<Self, Error> {
        let queue = Queue::open(path, maximum_length)?;
        Ok(Self::from_queue(queue, serializer, deserializer))
    }
}

impl<T, Ser, De, S> RecordQueue<T, Ser, De, S>
where
    Ser: Serializer<T>,
    De: Deserializer<T>,
    S: QueueStorage,
{
    pub fn from_queue(queue: Queue<S>, serializer: Ser, deserializer: De) -> Self {
        Self {
            queue,
            serializer,
            deserializer,
            _record: PhantomData,
        }
    }

    /// Number of records in the queue.
    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn file_size(&self) -> u64 {
        self.queue.file_size()
    }

    pub fn set_maximum_file_size(&mut self, value: u64) -> Result<(), Error> {
        self.queue.set_maximum_file_size(value)
    }

    /// Append one record.
    pub fn add(&mut self, record: &T) -> Result<(), Error> {
        let mut out = self.queue.element_output_stream()?;
        self.serializer.serialize(record, &mut out)?;
        out.close()
    }

    /// Append a batch of records in one atomic commit.
    pub fn add_all(&mut self, records: &[T]) -> Result<(), Error> {
        let mut out = self.queue.element_output_stream()?;
        for record in records {
            self.serializer.serialize(record, &mut out)?;
            out.next()?;
        }
        out.close()
    }

    /// The oldest record without removing it.
    pub fn peek(&mut self) -> Result<Option<T>, Error> {
        match self.queue.peek()? {
            None => Ok(None),
            Some(mut input) => self.deserializer.deserialize(&mut input).map(Some),
        }
    }

    /// Raw payload bytes of the oldest record.
    pub fn peek_bytes(&mut self) -> Result<Option<Bytes>, Error> {
        match self.queue.peek()? {
            None => Ok(None),
            Some(mut input) => {
                let mut buf = BytesMut::zeroed(input.available());
                let mut filled = 0;
                while filled < buf.len() {
                    let count = input.read(&mut buf[filled..])?;
                    if count == 0 {
                        break;
                    }
                    filled += count;
                }
                buf.truncate(filled);
                Ok(Some(buf.freeze()))
            }
        }
    }

    /// Up to `limit` oldest records whose collective payload stays within
    /// `size_limit` bytes. At least one record is always attempted. Records
    /// that fail to deserialize are logged, skipped, and counted.
    pub fn peek_many(&mut self, limit: usize, size_limit: usize) -> Result<PeekedRecords<T>, Error> {
        let mut records = Vec::new();
        let mut element_count = 0;
        let mut total_size = 0;

        let mut iter = self.queue.iter();
        while element_count < limit {
            let Some(mut input) = iter.next_stream()? else {
                break;
            };
            total_size += input.available();
            if element_count > 0 && total_size > size_limit {
                break;
            }
            match self.deserializer.deserialize(&mut input) {
                Ok(record) => records.push(record),
                Err(err) => warn!(error = %err, "invalid record ignored"),
            }
            element_count += 1;
        }

        Ok(PeekedRecords {
            records,
            element_count,
        })
    }

    /// Drop the `n` oldest records.
    pub fn remove(&mut self, n: usize) -> Result<(), Error> {
        self.queue.remove(n)
    }

    pub fn clear(&mut self) -> Result<(), Error> {
        self.queue.clear()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.queue.close()
    }
}
