//! Purpose: Define the stable public Rust API surface for stowage.
//! Exports: The queue, its storage backends, streams, and the typed layers.
//! Role: Public, additive-only surface for embedding applications.
//! Invariants: This module is the only public path to storage primitives.

mod records;
mod worker;

pub use crate::core::buffered::BufferedStorage;
pub use crate::core::direct::DirectFileStorage;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::queue::{ElementIter, Queue};
pub use crate::core::storage::QueueStorage;
pub use crate::core::stream::{ElementInputStream, ElementOutputStream};
pub use records::{
    Deserializer, JsonDeserializer, JsonSerializer, Measurement, PeekedRecords, RecordQueue,
    Serializer,
};
pub use worker::QueueWorker;
