//! Single-producer/single-consumer ring over a region of the shared segment.
//!
//! Cursor protocol: the writer publishes `write` with `Release` after the
//! slot store, the reader observes it with `Acquire` before loading the
//! slot, and symmetrically for `read`. On x86-64 these compile to plain
//! stores with a compiler barrier; the ordering still documents the
//! contract. A full ring drops the record and bumps `dropped`: the
//! producer runs inside traced application threads and must never block.
//!
//! Concurrency model: exactly one pusher and one popper per ring. The two
//! rings in a segment have opposite roles on each side.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::layout::RingHeader;

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum PushOutcome {
    Accepted,
    Dropped,
}

/// View over one ring's header and slot array inside a mapped segment.
///
/// The view does not own the memory; the [`crate::Segment`] that produced
/// it does. It is `Send`/`Sync` so one side can push from its producer
/// thread while keeping the struct inside a process-wide context; the
/// single-writer/single-reader discipline is the caller's obligation.
pub struct Ring<T> {
    header: NonNull<RingHeader>,
    slots: NonNull<T>,
}

unsafe impl<T: Copy + Send> Send for Ring<T> {}
unsafe impl<T: Copy + Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// # Safety
    ///
    /// `header` and `slots` must point into a mapping that stays alive for
    /// the view's lifetime, `slots` must hold `header.capacity` elements,
    /// and the capacity must be an initialized power of two. At most one
    /// thread may push and one may pop concurrently.
    pub unsafe fn from_raw(header: *const RingHeader, slots: *mut T) -> Self {
        Self {
            header: unsafe { NonNull::new_unchecked(header.cast_mut()) },
            slots: unsafe { NonNull::new_unchecked(slots) },
        }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { self.header.as_ref() }
    }

    /// Writes the cursor block. Only the segment creator may call this,
    /// before the other side can observe the ring.
    pub(crate) fn init_header(&self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "ring capacity must be 2^n");
        let h = self.header();
        h.capacity.store(capacity, Ordering::Relaxed);
        h.write.store(0, Ordering::Relaxed);
        h.read.store(0, Ordering::Relaxed);
        h.dropped.store(0, Ordering::Release);
    }

    /// Non-blocking push; a full ring leaves the buffer untouched and
    /// returns [`PushOutcome::Dropped`] after bumping the drop counter.
    #[inline]
    pub fn push(&self, value: T) -> PushOutcome {
        let h = self.header();
        let mask = h.capacity.load(Ordering::Relaxed) - 1;
        let write = h.write.load(Ordering::Relaxed);
        let read = h.read.load(Ordering::Acquire);
        let next = (write + 1) & mask;
        if next == read {
            h.dropped.fetch_add(1, Ordering::Relaxed);
            return PushOutcome::Dropped;
        }
        unsafe { self.slots.as_ptr().add(write as usize).write(value) };
        h.write.store(next, Ordering::Release);
        PushOutcome::Accepted
    }

    /// Non-blocking pop; `None` when the ring is empty.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let h = self.header();
        let read = h.read.load(Ordering::Relaxed);
        let write = h.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let value = unsafe { self.slots.as_ptr().add(read as usize).read() };
        let mask = h.capacity.load(Ordering::Relaxed) - 1;
        h.read.store((read + 1) & mask, Ordering::Release);
        Some(value)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let h = self.header();
        h.read.load(Ordering::Relaxed) == h.write.load(Ordering::Acquire)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity.load(Ordering::Relaxed)
    }

    /// Number of records the producer rejected so far. Eventually
    /// consistent; diagnostics only.
    #[inline]
    pub fn dropped(&self) -> u32 {
        self.header().dropped.load(Ordering::Relaxed)
    }
}
