//! Purpose: Pin one record queue to a dedicated worker thread.
//! Exports: `QueueWorker`.
//! Role: The queue itself is single-threaded by contract; this layer imposes
//! that contract for multi-threaded callers by executing every operation as a
//! discrete task on one thread and blocking the caller until it completes.
//! Invariants: Operations run in submission order, never overlapping.
//! Invariants: Corruption is handled here, not in the queue: the file is
//! deleted and recreated, accepting the data loss in exchange for liveness.

use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use tracing::{debug, error, warn};

use crate::api::records::{Deserializer, PeekedRecords, RecordQueue, Serializer};
use crate::core::buffered::BufferedStorage;
use crate::core::direct::DirectFileStorage;
use crate::core::error::{Error, ErrorKind};

type ProductionQueue<T, Ser, De> = RecordQueue<T, Ser, De, BufferedStorage<DirectFileStorage>>;

type Job<T, Ser, De> = Box<dyn FnOnce(&mut WorkerState<T, Ser, De>) + Send>;

struct WorkerState<T, Ser, De>
where
    Ser: Serializer<T>,
    De: Deserializer<T>,
{
    path: PathBuf,
    maximum_length: u64,
    serializer: Ser,
    deserializer: De,
    queue: ProductionQueue<T, Ser, De>,
}

impl<T, Ser, De> WorkerState<T, Ser, De>
where
    Ser: Serializer<T> + Clone,
    De: Deserializer<T> + Clone,
{
    /// Run an operation, recovering from a corrupt file by recreating it and
    /// retrying once. Only corruption triggers recovery; every other error is
    /// the caller's to handle.
    fn with_recovery<R>(
        &mut self,
        operation: impl Fn(&mut ProductionQueue<T, Ser, De>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        match operation(&mut self.queue) {
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                error!(
                    path = %self.path.display(),
                    error = %err,
                    "queue file corrupted; removing and recreating it"
                );
                self.recreate()?;
                operation(&mut self.queue)
            }
            other => other,
        }
    }

    fn recreate(&mut self) -> Result<(), Error> {
        let _ = self.queue.close();
        std::fs::remove_file(&self.path).map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_path(&self.path)
                .with_source(err)
        })?;
        self.queue = RecordQueue::open(
            &self.path,
            self.maximum_length,
            self.serializer.clone(),
            self.deserializer.clone(),
        )?;
        Ok(())
    }
}

/// Owns the worker thread and hands operations to it. The handle is cheap to
/// share behind an `Arc`; every call blocks until the worker has executed it.
pub struct QueueWorker<T, Ser, De>
where
    T: Send + 'static,
    Ser: Serializer<T> + Clone + Send + 'static,
    De: Deserializer<T> + Clone + Send + 'static,
{
    sender: Option<Sender<Job<T, Ser, De>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T, Ser, De> QueueWorker<T, Ser, De>
where
    T: Send + 'static,
    Ser: Serializer<T> + Clone + Send + 'static,
    De: Deserializer<T> + Clone + Send + 'static,
{
    /// Open the queue file and start its worker thread. An unreadable file is
    /// removed and recreated up front rather than failing the whole pipeline.
    pub fn open(
        path: impl Into<PathBuf>,
        maximum_length: u64,
        serializer: Ser,
        deserializer: De,
    ) -> Result<Self, Error> {
        let path = path.into();
        let queue = match RecordQueue::open(
            &path,
            maximum_length,
            serializer.clone(),
            deserializer.clone(),
        ) {
            Ok(queue) => queue,
            // Only a corruption report justifies destroying the file; a lock
            // or permission failure means someone else may still own it.
            Err(err) if err.kind() == ErrorKind::Corrupt => {
                error!(
                    path = %path.display(),
                    error = %err,
                    "queue file corrupted; removing old file"
                );
                std::fs::remove_file(&path).map_err(|err| {
                    Error::new(ErrorKind::Io).with_path(&path).with_source(err)
                })?;
                RecordQueue::open(&path, maximum_length, serializer.clone(), deserializer.clone())?
            }
            Err(err) => return Err(err),
        };

        let mut state = WorkerState {
            path,
            maximum_length,
            serializer,
            deserializer,
            queue,
        };
        let (sender, receiver) = channel::unbounded::<Job<T, Ser, De>>();
        let handle = thread::Builder::new()
            .name("stowage-queue".into())
            .spawn(move || {
                for job in receiver {
                    job(&mut state);
                }
                if let Err(err) = state.queue.close() {
                    warn!(error = %err, "closing queue at worker shutdown failed");
                }
                debug!("queue worker stopped");
            })
            .map_err(|err| Error::new(ErrorKind::Io).with_source(err))?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Rendezvous: run `operation` on the worker and wait for its result.
    fn execute<R: Send + 'static>(
        &self,
        operation: impl FnOnce(&mut WorkerState<T, Ser, De>) -> R + Send + 'static,
    ) -> Result<R, Error> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::Usage).with_message("queue worker is closed"))?;
        let (reply, result) = channel::bounded(1);
        sender
            .send(Box::new(move |state: &mut WorkerState<T, Ser, De>| {
                let _ = reply.send(operation(state));
            }))
            .map_err(|_| Error::new(ErrorKind::Usage).with_message("queue worker stopped"))?;
        result
            .recv()
            .map_err(|_| Error::new(ErrorKind::Io).with_message("queue worker dropped the operation"))
    }

    /// Append one record.
    pub fn add(&self, record: T) -> Result<(), Error> {
        self.execute(move |state| state.with_recovery(|queue| queue.add(&record)))?
    }

    /// Append a batch of records in one atomic commit.
    pub fn add_all(&self, records: Vec<T>) -> Result<(), Error> {
        self.execute(move |state| state.with_recovery(|queue| queue.add_all(&records)))?
    }

    /// The oldest records within the given bounds; see `RecordQueue::peek_many`.
    pub fn peek_many(&self, limit: usize, size_limit: usize) -> Result<PeekedRecords<T>, Error> {
        self.execute(move |state| {
            state.with_recovery(|queue| queue.peek_many(limit, size_limit))
        })?
    }

    /// Drop the `n` oldest records.
    pub fn remove(&self, n: usize) -> Result<(), Error> {
        self.execute(move |state| state.with_recovery(|queue| queue.remove(n)))?
    }

    /// Number of records in the queue.
    pub fn size(&self) -> Result<usize, Error> {
        self.execute(|state| state.queue.size())
    }

    /// Current size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64, Error> {
        self.execute(|state| state.queue.file_size())
    }

    pub fn set_maximum_file_size(&self, value: u64) -> Result<(), Error> {
        self.execute(move |state| {
            state.maximum_length = value;
            state.queue.set_maximum_file_size(value)
        })?
    }

    /// Stop the worker after it drains the operations already submitted.
    pub fn close(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::new(ErrorKind::Io).with_message("queue worker panicked"))?;
        }
        Ok(())
    }
}

impl<T, Ser, De> Drop for QueueWorker<T, Ser, De>
where
    T: Send + 'static,
    Ser: Serializer<T> + Clone + Send + 'static,
    De: Deserializer<T> + Clone + Send + 'static,
{
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            warn!(error = %err, "queue worker shutdown failed");
        }
    }
}
