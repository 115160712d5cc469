//! Timestamp-ordered latency buffers.
//!
//! A latency buffer is a bounded container ordered by frame timestamp with a
//! lower-bound lookup: the single consumer thread writes elements at the
//! back, request threads search and walk windows, the cleanup thread pops
//! from the front. Two variants implement the same contract:
//!
//! - [`ring::RingLatencyBuffer`]: preallocated, contiguous, cache-friendly;
//!   for producers that deliver in timestamp order (binary-search lookup,
//!   optional O(1) fixed-rate estimate).
//! - [`skiplist::SkipListLatencyBuffer`]: lock-free skip list; for
//!   producers that deliver out of order (e.g. trigger primitives).
//!
//! Instead of handing out iterators, both variants expose bounded visitation
//! ([`LatencyBuffer::for_each_from`]): the caller walks elements in
//! timestamp order from a lookup key under its own synchronisation regime.
//! Request paths hold the cleanup gate for the whole walk, which is what
//! keeps captured payload pointers alive (see the request handler).

pub mod ring;
pub mod skiplist;

use std::ops::ControlFlow;

use crate::config::LatencyBufferConfig;
use crate::error::Result;
use crate::frame::FrameType;
use crate::types::{SourceId, Timestamp};

/// Where a visitation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStart {
    /// The oldest element.
    Begin,
    /// The smallest element with `timestamp >= key` (lower bound).
    Key(Timestamp),
}

/// The raw memory region backing a contiguous buffer variant, for the
/// zero-copy recording engine.
#[derive(Debug, Clone, Copy)]
pub struct BufferRegion {
    pub start: *const u8,
    /// Bytes of element storage (slot count × element size).
    pub len: usize,
    pub element_size: usize,
}

/// Common contract of both latency-buffer variants.
///
/// All methods take `&self`: the implementations carry their own interior
/// synchronisation, sized once at construction and never growing.
pub trait LatencyBuffer<F: FrameType>: Send + Sync + 'static {
    /// Allocates a buffer of `cfg.size` elements. Fails with a
    /// configuration error when the backing region cannot be allocated with
    /// the required alignment.
    fn new(cfg: &LatencyBufferConfig, sourceid: SourceId) -> Result<Self>
    where
        Self: Sized;

    /// Configured capacity in elements.
    fn capacity(&self) -> usize;

    /// Current element count; never exceeds [`LatencyBuffer::capacity`].
    fn occupancy(&self) -> usize;

    /// Appends an element. Returns `false` when the element displaced the
    /// oldest one (ring) or could not be stored as a new entry (skip list),
    /// so the caller can count the loss.
    fn write(&self, element: F) -> bool;

    /// Pops and returns the oldest element.
    fn read(&self) -> Option<F>;

    /// Pops up to `count` elements from the front; returns how many.
    fn pop(&self, count: usize) -> usize;

    /// Drains the buffer.
    fn flush(&self) {
        while self.pop(1024) > 0 {}
    }

    /// Timestamp of the oldest element.
    fn front_timestamp(&self) -> Option<Timestamp>;

    /// Timestamp of the newest element.
    fn back_timestamp(&self) -> Option<Timestamp>;

    /// Pointer to the newest element, for the post-processing hand-off.
    /// Valid until that element is popped or overwritten.
    fn back_frame_ptr(&self) -> Option<*const F>;

    /// Walks elements in timestamp order starting at `start` until the
    /// buffer end or until `visit` breaks.
    ///
    /// Returns `false` when the lookup found no starting element: the buffer
    /// is empty, the key lies past the newest element, or the key lies
    /// before the oldest element and `with_errors` is not set. With
    /// `with_errors` set, a key before the oldest element starts the walk at
    /// the front, the one place the error registry changes behaviour.
    fn for_each_from(
        &self,
        start: LookupStart,
        with_errors: bool,
        visit: &mut dyn FnMut(&F) -> ControlFlow<()>,
    ) -> bool;

    /// Alignment of the backing allocation in bytes; 0 when the variant is
    /// not contiguous.
    fn alignment_size(&self) -> usize {
        0
    }

    /// The backing memory region, when contiguous.
    fn contiguous_region(&self) -> Option<BufferRegion> {
        None
    }
}
