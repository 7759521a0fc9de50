//! Fixed-capacity circular frame buffer.
//!
//! Backs the consume-own-events loopback path: the send path copies each
//! outbound frame in, and `process()` drains it ahead of the bus source.
//! When full, `put` overwrites the oldest entry — the protocol prefers the
//! freshest frames over strict completeness, so overflow is metered rather
//! than rejected.
//!
//! Not safe for concurrent producers or consumers; the core is
//! single-threaded by contract.
//!
//! # Example
//!
//! ```
//! use railbus::protocol::{CircularFrameBuffer, Frame};
//!
//! let mut buffer = CircularFrameBuffer::new(4);
//! buffer.put(&Frame::with_payload(&[0x90, 0, 1, 0, 2]), 1_000);
//! assert!(buffer.available());
//! let frame = buffer.get().unwrap();
//! assert_eq!(frame.event_number(), 2);
//! ```

use super::Frame;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    frame: Frame,
    inserted_at: u64,
}

/// Ring buffer of [`Frame`]s with overwrite-on-full semantics.
///
/// Counters:
/// - `puts` / `gets`: total insertions and removals
/// - `overflows`: insertions that displaced an unread frame
/// - `hwm`: high-water mark, the maximum size ever observed
///
/// Invariant: `puts == gets + size + overflows` holds across any operation
/// sequence.
#[derive(Debug)]
pub struct CircularFrameBuffer {
    slots: Vec<Slot>,
    head: usize,
    tail: usize,
    full: bool,
    puts: u64,
    gets: u64,
    overflows: u64,
    hwm: usize,
}

impl CircularFrameBuffer {
    /// Create a buffer holding up to `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            slots: vec![Slot::default(); capacity],
            head: 0,
            tail: 0,
            full: false,
            puts: 0,
            gets: 0,
            overflows: 0,
            hwm: 0,
        }
    }

    /// Insert a frame, stamping it with `now_ms`.
    ///
    /// When the buffer is full the oldest unread frame is overwritten and
    /// the overflow counter incremented.
    pub fn put(&mut self, frame: &Frame, now_ms: u64) {
        self.slots[self.head] = Slot {
            frame: *frame,
            inserted_at: now_ms,
        };
        if self.full {
            self.tail = (self.tail + 1) % self.capacity();
            self.overflows += 1;
        }
        self.head = (self.head + 1) % self.capacity();
        self.full = self.head == self.tail;
        self.puts += 1;
        self.hwm = self.hwm.max(self.size());
    }

    /// Remove and return the oldest frame, or `None` when empty.
    pub fn get(&mut self) -> Option<Frame> {
        if self.is_empty() {
            return None;
        }
        let frame = self.slots[self.tail].frame;
        self.full = false;
        self.tail = (self.tail + 1) % self.capacity();
        self.gets += 1;
        Some(frame)
    }

    /// The oldest frame without removing it.
    pub fn peek(&self) -> Option<&Frame> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.tail].frame)
        }
    }

    /// Timestamp recorded when the oldest frame was inserted.
    ///
    /// Valid until the next [`get`](Self::get) consumes that slot.
    pub fn insert_time(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.slots[self.tail].inserted_at)
        }
    }

    /// Is at least one frame available?
    #[inline]
    pub fn available(&self) -> bool {
        !self.is_empty()
    }

    /// Number of frames currently buffered.
    pub fn size(&self) -> usize {
        if self.full {
            self.capacity()
        } else if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.capacity() + self.head - self.tail
        }
    }

    /// Number of unoccupied slots.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.capacity() - self.size()
    }

    /// Total capacity fixed at construction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.full
    }

    /// Discard all buffered frames.
    ///
    /// Counters are left untouched; the metering identity
    /// `puts == gets + size + overflows` only holds over put/get sequences.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.full = false;
    }

    /// Total frames inserted.
    #[inline]
    pub fn puts(&self) -> u64 {
        self.puts
    }

    /// Total frames removed.
    #[inline]
    pub fn gets(&self) -> u64 {
        self.gets
    }

    /// Insertions that displaced an unread frame.
    #[inline]
    pub fn overflows(&self) -> u64 {
        self.overflows
    }

    /// Maximum size ever observed.
    #[inline]
    pub fn hwm(&self) -> usize {
        self.hwm
    }
}
