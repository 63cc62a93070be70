//! Purpose: The committed queue header: the single source of queue visibility.
//! Exports: `QueueHeader`.
//! Role: Encode/decode and persist the 36-byte header at file offset 0.
//! Invariants: Every mutating queue operation writes this header last, so a
//! crash leaves either the old or the new queue state, never a mix.
//! Invariants: `count == 0` iff both element positions are 0.

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, QUEUE_HEADER_LENGTH};
use crate::core::storage::QueueStorage;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueHeader {
    /// Total size of the backing storage, header included.
    pub length: u64,
    /// Number of live elements.
    pub count: u32,
    /// Offset of the oldest element header, 0 when empty.
    pub first_position: u64,
    /// Offset of the newest element header, 0 when empty.
    pub last_position: u64,
}

impl QueueHeader {
    /// Header for a freshly initialized, empty queue file.
    pub fn fresh(length: u64) -> Self {
        Self {
            length,
            count: 0,
            first_position: 0,
            last_position: 0,
        }
    }

    pub fn encode(&self) -> [u8; QUEUE_HEADER_LENGTH as usize] {
        let mut buf = [0u8; QUEUE_HEADER_LENGTH as usize];
        buf[0..4].copy_from_slice(&format::VERSION.to_be_bytes());
        buf[4..12].copy_from_slice(&self.length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.count.to_be_bytes());
        buf[16..24].copy_from_slice(&self.first_position.to_be_bytes());
        buf[24..32].copy_from_slice(&self.last_position.to_be_bytes());
        let checksum = format::header_checksum(
            format::VERSION,
            self.length,
            self.count,
            self.first_position,
            self.last_position,
        );
        buf[32..36].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < QUEUE_HEADER_LENGTH as usize {
            return Err(Error::new(ErrorKind::Corrupt).with_message("queue header too small"));
        }
        let version = u32::from_be_bytes(read_4(buf, 0));
        let length = u64::from_be_bytes(read_8(buf, 4));
        let count = u32::from_be_bytes(read_4(buf, 12));
        let first_position = u64::from_be_bytes(read_8(buf, 16));
        let last_position = u64::from_be_bytes(read_8(buf, 24));
        let stored_checksum = u32::from_be_bytes(read_4(buf, 32));

        let expected =
            format::header_checksum(version, length, count, first_position, last_position);
        if stored_checksum != expected {
            return Err(Error::new(ErrorKind::Corrupt).with_message("queue header checksum mismatch"));
        }
        if version != format::VERSION {
            return Err(format::version_error(version));
        }

        let header = Self {
            length,
            count,
            first_position,
            last_position,
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.length < format::MINIMUM_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("queue length {} below minimum", self.length)));
        }
        if self.count == 0 {
            if self.first_position != 0 || self.last_position != 0 {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("empty queue with non-zero element positions"));
            }
            return Ok(());
        }
        for position in [self.first_position, self.last_position] {
            if position < QUEUE_HEADER_LENGTH || position >= self.length {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("element position outside storage")
                    .with_offset(position));
            }
        }
        Ok(())
    }

    pub fn read<S: QueueStorage>(storage: &mut S) -> Result<Self, Error> {
        let mut buf = [0u8; QUEUE_HEADER_LENGTH as usize];
        storage.read(0, &mut buf)?;
        Self::decode(&buf)
    }

    /// Commit the header. This is the visibility point of every mutation, so
    /// the bytes are flushed before returning.
    pub fn write<S: QueueStorage>(&self, storage: &mut S) -> Result<(), Error> {
        storage.write(0, &self.encode(), false)?;
        storage.flush()
    }

    /// Reset to the empty state, keeping the recorded length.
    pub fn clear(&mut self) {
        self.count = 0;
        self.first_position = 0;
        self.last_position = 0;
    }
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}
