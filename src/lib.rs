//! Purpose: Crash-resilient, file-backed FIFO queue for buffering byte records on-device.
//! Exports: `core` (ring-buffer queue, storage backends, streams) and `api` (typed records, worker).
//! Role: Library crate; the durability boundary between "record captured" and "record relayed".
//! Invariants: A structural mutation becomes visible only once its header commit reaches the file.
//! Invariants: The queue is single-writer/single-reader; all access requires exclusive ownership.
pub mod api;
pub mod core;
