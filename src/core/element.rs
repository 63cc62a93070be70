// One stored record: a 5-byte header (payload length + checksum byte) followed by payload.
use crate::core::format::{self, ELEMENT_HEADER_LENGTH, QUEUE_HEADER_LENGTH};

/// Position and payload length of one element. The position is a wrapped
/// storage offset; `next_position` is virtual and must be wrapped before use.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Element {
    pub position: u64,
    pub length: u32,
}

impl Element {
    pub fn new(position: u64, length: u32) -> Self {
        Self { position, length }
    }

    /// An element that has had no payload written yet. The all-zero sentinel
    /// (position 0) doubles as "no element" in header fields and caches.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn reset(&mut self) {
        *self = Element::default();
    }

    pub fn crc(&self) -> u8 {
        format::element_crc(self.length)
    }

    /// Virtual offset of the first payload byte.
    pub fn data_position(&self) -> u64 {
        self.position + ELEMENT_HEADER_LENGTH
    }

    /// Virtual offset one past the payload; for the zero sentinel this is the
    /// end of the queue header, where the first element of an empty queue goes.
    pub fn next_position(&self) -> u64 {
        if self.position == 0 && self.length == 0 {
            QUEUE_HEADER_LENGTH
        } else {
            self.position + ELEMENT_HEADER_LENGTH + u64::from(self.length)
        }
    }

    pub fn total_length(&self) -> u64 {
        ELEMENT_HEADER_LENGTH + u64::from(self.length)
    }

    pub fn encode_header(&self) -> [u8; ELEMENT_HEADER_LENGTH as usize] {
        let mut buf = [0u8; ELEMENT_HEADER_LENGTH as usize];
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4] = self.crc();
        buf
    }
}
