//! Purpose: Random-access file storage backend for the queue ring buffer.
//! Exports: `DirectFileStorage`.
//! Role: Owns the file handle, its length, and the exclusive lock; implements
//! wraparound by splitting I/O at the physical end of the file.
//! Invariants: Growth reaches the disk before the caller can commit a header
//! that claims the new length.
//! Invariants: The advisory lock is held for the storage lifetime, making the
//! single-process single-writer assumption explicit.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, MINIMUM_LENGTH, QUEUE_HEADER_LENGTH};
use crate::core::storage::QueueStorage;

/// Largest file length the on-disk format addresses.
const MAXIMUM_ADDRESSABLE: u64 = i32::MAX as u64;

#[derive(Debug)]
pub struct DirectFileStorage {
    path: PathBuf,
    file: File,
    length: u64,
    maximum_length: u64,
    closed: bool,
    pre_existing: bool,
}

impl DirectFileStorage {
    /// Open `path`, creating it at `initial_length` bytes if absent. An
    /// existing file smaller than the queue header is reported as corrupt.
    pub fn open(
        path: impl AsRef<Path>,
        initial_length: u64,
        maximum_length: u64,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if initial_length < MINIMUM_LENGTH {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "initial length {initial_length} is smaller than minimum length {MINIMUM_LENGTH}"
            )));
        }
        if maximum_length > MAXIMUM_ADDRESSABLE {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "maximum length {maximum_length} out of addressable range"
            )));
        }
        if initial_length > maximum_length {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "initial length {initial_length} exceeds maximum length {maximum_length}"
            )));
        }

        let pre_existing = path.exists();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;

        file.try_lock_exclusive().map_err(|err| {
            Error::new(lock_error_kind(&err))
                .with_path(&path)
                .with_source(err)
        })?;

        let length = if pre_existing {
            let current = file
                .metadata()
                .map(|meta| meta.len())
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
            if current < QUEUE_HEADER_LENGTH {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_path(&path)
                    .with_message(format!(
                        "file length {current} is smaller than queue header length {QUEUE_HEADER_LENGTH}"
                    )));
            }
            current
        } else {
            file.set_len(initial_length)
                .map_err(|err| Error::new(ErrorKind::Io).with_path(&path).with_source(err))?;
            initial_length
        };

        Ok(Self {
            path,
            file,
            length,
            maximum_length: maximum_length.max(MINIMUM_LENGTH),
            closed: false,
            pre_existing,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn require_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::new(ErrorKind::Usage)
                .with_path(&self.path)
                .with_message("storage is closed"));
        }
        Ok(())
    }

    /// Wrap and range-check a virtual position.
    fn checked_wrap(&self, position: u64) -> Result<u64, Error> {
        let wrapped = format::wrap_position(position, self.length);
        if wrapped >= self.length {
            return Err(Error::new(ErrorKind::Usage)
                .with_path(&self.path)
                .with_offset(position)
                .with_message(format!(
                    "position {position} invalid outside of storage length {}",
                    self.length
                )));
        }
        Ok(wrapped)
    }

    fn io_error(&self, err: io::Error) -> Error {
        let kind = if err.kind() == io::ErrorKind::UnexpectedEof {
            ErrorKind::Corrupt
        } else {
            ErrorKind::Io
        };
        Error::new(kind).with_path(&self.path).with_source(err)
    }

    fn seek_read(&mut self, offset: u64, data: &mut [u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.read_exact(data))
            .map_err(|err| self.io_error(err))
    }

    fn seek_write(&mut self, offset: u64, data: &[u8]) -> Result<(), Error> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|err| self.io_error(err))
    }
}

impl QueueStorage for DirectFileStorage {
    fn length(&self) -> u64 {
        self.length
    }

    fn minimum_length(&self) -> u64 {
        MINIMUM_LENGTH
    }

    fn maximum_length(&self) -> u64 {
        self.maximum_length
    }

    fn set_maximum_length(&mut self, value: u64) -> Result<(), Error> {
        if value > MAXIMUM_ADDRESSABLE {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "maximum length {value} out of addressable range"
            )));
        }
        self.maximum_length = value.max(MINIMUM_LENGTH);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn is_pre_existing(&self) -> bool {
        self.pre_existing
    }

    fn write(&mut self, position: u64, data: &[u8], _may_ignore_buffer: bool) -> Result<u64, Error> {
        self.require_open()?;
        let count = data.len() as u64;
        if count + QUEUE_HEADER_LENGTH > self.length {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "write of {count} bytes exceeds storage length {}",
                self.length
            )));
        }
        let wrapped = self.checked_wrap(position)?;
        let linear = self.length - wrapped;
        if count <= linear {
            self.seek_write(wrapped, data)?;
            Ok(format::wrap_position(wrapped + count, self.length))
        } else {
            // The write overlaps the end of the file; resume after the header.
            let first = linear as usize;
            if first > 0 {
                self.seek_write(wrapped, &data[..first])?;
            }
            self.seek_write(QUEUE_HEADER_LENGTH, &data[first..])?;
            Ok(QUEUE_HEADER_LENGTH + count - first as u64)
        }
    }

    fn read(&mut self, position: u64, data: &mut [u8]) -> Result<u64, Error> {
        self.require_open()?;
        let count = data.len() as u64;
        if count + QUEUE_HEADER_LENGTH > self.length {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "read of {count} bytes exceeds storage length {}",
                self.length
            )));
        }
        let wrapped = self.checked_wrap(position)?;
        if wrapped + count <= self.length {
            self.seek_read(wrapped, data)?;
            Ok(format::wrap_position(wrapped + count, self.length))
        } else {
            let first = (self.length - wrapped) as usize;
            self.seek_read(wrapped, &mut data[..first])?;
            self.seek_read(QUEUE_HEADER_LENGTH, &mut data[first..])?;
            Ok(QUEUE_HEADER_LENGTH + count - first as u64)
        }
    }

    fn move_region(&mut self, src: u64, dst: u64, count: u64) -> Result<(), Error> {
        self.require_open()?;
        if count == 0 || src + count > self.length || dst + count > self.length {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "movement src={src}, count={count}, dst={dst} is invalid for storage of length {}",
                self.length
            )));
        }
        self.flush()?;
        // Fully buffered copy: safe even if the regions were to overlap.
        let mut chunk = vec![0u8; count as usize];
        self.seek_read(src, &mut chunk)?;
        self.seek_write(dst, &chunk)?;
        Ok(())
    }

    fn resize(&mut self, size: u64) -> Result<(), Error> {
        self.require_open()?;
        if size == self.length {
            return Ok(());
        }
        if size > self.length && size > self.maximum_length {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "new length {size} exceeds maximum length {}",
                self.maximum_length
            )));
        }
        if size < MINIMUM_LENGTH {
            return Err(Error::new(ErrorKind::Usage).with_message(format!(
                "new length {size} is less than minimum length {MINIMUM_LENGTH}"
            )));
        }
        self.flush()?;
        self.file
            .set_len(size)
            .and_then(|_| self.file.sync_all())
            .map_err(|err| self.io_error(err))?;
        self.length = size;
        Ok(())
    }

    fn wrap_position(&self, position: u64) -> u64 {
        format::wrap_position(position, self.length)
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.require_open()?;
        self.file.sync_data().map_err(|err| self.io_error(err))
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.file.sync_all();
        let _ = self.file.unlock();
        result.map_err(|err| Error::new(ErrorKind::Io).with_path(&self.path).with_source(err))
    }
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

#[cfg(test)]
mod tests {
    use super::DirectFileStorage;
    use crate::core::error::ErrorKind;
    use crate::core::format::{MINIMUM_LENGTH, QUEUE_HEADER_LENGTH};
    use crate::core::storage::QueueStorage;

    fn storage(dir: &tempfile::TempDir) -> DirectFileStorage {
        let path = dir.path().join("queue.stow");
        DirectFileStorage::open(&path, MINIMUM_LENGTH, MINIMUM_LENGTH * 16).expect("open")
    }

    #[test]
    fn create_sets_initial_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = storage(&dir);
        assert_eq!(storage.length(), MINIMUM_LENGTH);
        assert!(!storage.is_pre_existing());
    }

    #[test]
    fn write_and_read_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        let data = [7u8; 64];
        let end = storage.write(QUEUE_HEADER_LENGTH, &data, false).expect("write");
        assert_eq!(end, QUEUE_HEADER_LENGTH + 64);

        let mut out = [0u8; 64];
        let end = storage.read(QUEUE_HEADER_LENGTH, &mut out).expect("read");
        assert_eq!(end, QUEUE_HEADER_LENGTH + 64);
        assert_eq!(out, data);
    }

    #[test]
    fn writes_split_across_end_of_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        let start = MINIMUM_LENGTH - 10;
        let data: Vec<u8> = (0..30).collect();
        let end = storage.write(start, &data, false).expect("write");
        assert_eq!(end, QUEUE_HEADER_LENGTH + 20);

        let mut out = vec![0u8; 30];
        let end = storage.read(start, &mut out).expect("read");
        assert_eq!(end, QUEUE_HEADER_LENGTH + 20);
        assert_eq!(out, data);
    }

    #[test]
    fn read_past_length_is_a_usage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        let mut out = vec![0u8; MINIMUM_LENGTH as usize];
        let err = storage.read(QUEUE_HEADER_LENGTH, &mut out).expect_err("too large");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn resize_grows_and_shrinks_within_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        storage.resize(MINIMUM_LENGTH * 2).expect("grow");
        assert_eq!(storage.length(), MINIMUM_LENGTH * 2);
        storage.resize(MINIMUM_LENGTH).expect("shrink");
        assert_eq!(storage.length(), MINIMUM_LENGTH);

        let err = storage.resize(MINIMUM_LENGTH * 32).expect_err("beyond maximum");
        assert_eq!(err.kind(), ErrorKind::Usage);
        let err = storage.resize(QUEUE_HEADER_LENGTH).expect_err("below minimum");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn pre_existing_file_below_header_length_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.stow");
        std::fs::write(&path, [0u8; 10]).expect("write short file");
        let err = DirectFileStorage::open(&path, MINIMUM_LENGTH, MINIMUM_LENGTH * 4)
            .expect_err("short file");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn second_open_is_rejected_while_locked() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.stow");
        let _storage = DirectFileStorage::open(&path, MINIMUM_LENGTH, MINIMUM_LENGTH * 4)
            .expect("first open");
        let err = DirectFileStorage::open(&path, MINIMUM_LENGTH, MINIMUM_LENGTH * 4)
            .expect_err("second open");
        assert_eq!(err.kind(), ErrorKind::Busy);
    }

    #[test]
    fn operations_fail_after_close() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        storage.close().expect("close");
        let err = storage
            .write(QUEUE_HEADER_LENGTH, &[1, 2, 3], false)
            .expect_err("closed");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[test]
    fn move_region_copies_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut storage = storage(&dir);
        let data = [9u8; 16];
        storage.write(QUEUE_HEADER_LENGTH, &data, false).expect("write");
        storage
            .move_region(QUEUE_HEADER_LENGTH, 1024, 16)
            .expect("move");
        let mut out = [0u8; 16];
        storage.read(1024, &mut out).expect("read");
        assert_eq!(out, data);
    }
}
