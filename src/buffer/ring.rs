//! Preallocated array-ring latency buffer for fixed-rate producers.
//!
//! One contiguous, page-aligned allocation holds `capacity + 1` slots (one
//! slot stays empty to distinguish full from empty). The single producer
//! writes at the write index; consumers pop at the read index with a CAS so
//! a cleanup and a producer-side overwrite never retire the same slot
//! twice. When the ring is full, a write displaces the oldest element and
//! reports it through its return value.
//!
//! The lookup is a wrapping binary search over the occupied span; with
//! `fixed_rate_lookup` set it first estimates the slot analytically from the
//! constant stride and verifies with at most two probes.
//!
//! # Concurrency contract
//!
//! Readers that walk elements while the producer wraps around accept
//! possibly-stale reads; request paths exclude cleanups via the handler's
//! gate, which is what makes captured payload pointers safe until fragment
//! linearisation. Element types are plain old data (the frame-type contract
//! reproduces the wire layout), so a racy re-read of a recycled slot yields
//! stale bytes, never an invalid value.

use std::alloc::{self, Layout};
use std::ops::ControlFlow;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{BufferRegion, LatencyBuffer, LookupStart};
use crate::config::LatencyBufferConfig;
use crate::error::{ReadoutError, Result};
use crate::frame::FrameType;
use crate::types::{SourceId, Timestamp};

/// Alignment of the backing allocation. Matches the filesystem block size so
/// the zero-copy recorder can issue `O_DIRECT` writes straight from buffer
/// memory.
pub const BUFFER_ALIGNMENT: usize = 4096;

/// Outcome of the fixed-rate analytic probe.
enum Probe {
    /// Verified slot index.
    Hit(usize),
    /// The key lies past the newest element.
    End,
    /// Estimate did not verify; fall back to binary search.
    Miss,
}

pub struct RingLatencyBuffer<F: FrameType> {
    storage: NonNull<F>,
    layout: Layout,
    /// Slot count, `capacity + 1`.
    slots: usize,
    read_index: AtomicUsize,
    write_index: AtomicUsize,
    fixed_rate: bool,
}

// SAFETY: the storage region is owned by the buffer for its whole lifetime;
// slot hand-over between threads goes through the read/write indices with
// acquire/release ordering, and front retirement is CAS-guarded.
unsafe impl<F: FrameType> Send for RingLatencyBuffer<F> {}
unsafe impl<F: FrameType> Sync for RingLatencyBuffer<F> {}

impl<F: FrameType> RingLatencyBuffer<F> {
    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut F {
        debug_assert!(index < self.slots);
        // SAFETY: index < slots, within the allocation.
        unsafe { self.storage.as_ptr().add(index) }
    }

    #[inline]
    fn next_index(&self, index: usize) -> usize {
        let next = index + 1;
        if next == self.slots {
            0
        } else {
            next
        }
    }

    #[inline]
    fn prev_index(&self, index: usize) -> usize {
        if index == 0 {
            self.slots - 1
        } else {
            index - 1
        }
    }

    /// Timestamp of the element in `index`.
    ///
    /// SAFETY of the contained read: callers only pass indices inside the
    /// occupied `[read, write)` span observed from the atomics; stale values
    /// after a concurrent pop are tolerated by the lookup contract.
    #[inline]
    fn timestamp_at(&self, index: usize) -> Timestamp {
        unsafe { (*self.slot_ptr(index)).timestamp() }
    }

    /// Wrapping binary search for the smallest occupied slot with
    /// `timestamp >= key`, scanning `[start, last]`. `write` is the loaded
    /// write index delimiting the span.
    fn binary_search(&self, mut start: usize, mut last: usize, write: usize, key: Timestamp) -> Option<usize> {
        loop {
            let diff = if start <= last {
                last - start
            } else {
                self.slots + last - start
            };
            let mut middle = start + (diff + 1) / 2;
            if middle >= self.slots {
                middle -= self.slots;
            }
            let middle_ts = self.timestamp_at(middle);

            if key == middle_ts {
                return Some(middle);
            }
            if diff == 0 {
                if key < middle_ts {
                    return Some(middle);
                }
                let next = self.next_index(middle);
                if next == write {
                    return None;
                }
                return Some(next);
            }
            if key < middle_ts {
                last = self.prev_index(middle);
            } else {
                start = middle;
            }
        }
    }

    /// Analytic slot estimate for constant-stride data, verified with at
    /// most two probes.
    fn fixed_rate_probe(
        &self,
        read: usize,
        write: usize,
        front_ts: Timestamp,
        key: Timestamp,
    ) -> Probe {
        let stride = F::stride();
        if stride == 0 {
            return Probe::Miss;
        }
        let occupancy = (write + self.slots - read) % self.slots;
        let offset = ((key - front_ts) + stride - 1) / stride;
        if offset as usize >= occupancy {
            // Would land past the newest element; the caller already
            // bounds-checked the key against the back, so only an irregular
            // stride gets here.
            return Probe::Miss;
        }
        let estimate = (read + offset as usize) % self.slots;
        let estimate_ts = self.timestamp_at(estimate);
        if estimate_ts >= key {
            if estimate == read || self.timestamp_at(self.prev_index(estimate)) < key {
                return Probe::Hit(estimate);
            }
        } else {
            let next = self.next_index(estimate);
            if next == write {
                return Probe::End;
            }
            if self.timestamp_at(next) >= key {
                return Probe::Hit(next);
            }
        }
        Probe::Miss
    }

    /// Slot of the smallest element with `timestamp >= key`, or `None` for
    /// *end* per the lookup rules.
    fn lower_bound_index(&self, key: Timestamp, with_errors: bool) -> Option<usize> {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let last = self.prev_index(write);
        let front_ts = self.timestamp_at(read);
        if key < front_ts {
            // The single place the error registry changes behaviour: widen
            // the search to the whole buffer instead of failing.
            return with_errors.then_some(read);
        }
        if key > self.timestamp_at(last) {
            return None;
        }
        if self.fixed_rate {
            match self.fixed_rate_probe(read, write, front_ts, key) {
                Probe::Hit(index) => return Some(index),
                Probe::End => return None,
                Probe::Miss => {}
            }
        }
        self.binary_search(read, last, write, key)
    }

    /// CAS-advance the read index by one slot, dropping the element.
    fn pop_one(&self) -> bool {
        loop {
            let read = self.read_index.load(Ordering::Relaxed);
            if read == self.write_index.load(Ordering::Acquire) {
                return false;
            }
            let next = self.next_index(read);
            if self
                .read_index
                .compare_exchange(read, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                if std::mem::needs_drop::<F>() {
                    // SAFETY: the CAS made this thread the sole retirer of
                    // slot `read`, and the slot held an initialized element.
                    unsafe { std::ptr::drop_in_place(self.slot_ptr(read)) };
                }
                return true;
            }
        }
    }
}

impl<F: FrameType> LatencyBuffer<F> for RingLatencyBuffer<F> {
    fn new(cfg: &LatencyBufferConfig, sourceid: SourceId) -> Result<Self> {
        cfg.validate(sourceid)?;
        let slots = cfg.size + 1;
        let layout = Layout::array::<F>(slots)
            .and_then(|l| l.align_to(BUFFER_ALIGNMENT))
            .map_err(|_| {
                ReadoutError::configuration(sourceid, "latency buffer layout overflow")
            })?
            .pad_to_align();
        // SAFETY: layout has non-zero size (slots >= 2).
        let raw = unsafe { alloc::alloc(layout) };
        let storage = NonNull::new(raw as *mut F).ok_or_else(|| {
            ReadoutError::configuration(sourceid, "latency buffer cannot be allocated with size")
        })?;
        debug!(
            capacity = cfg.size,
            bytes = layout.size(),
            fixed_rate = cfg.fixed_rate_lookup,
            "allocated ring latency buffer"
        );
        Ok(Self {
            storage,
            layout,
            slots,
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
            fixed_rate: cfg.fixed_rate_lookup,
        })
    }

    fn capacity(&self) -> usize {
        self.slots - 1
    }

    fn occupancy(&self) -> usize {
        let read = self.read_index.load(Ordering::Relaxed);
        let write = self.write_index.load(Ordering::Acquire);
        (write + self.slots - read) % self.slots
    }

    fn write(&self, element: F) -> bool {
        let write = self.write_index.load(Ordering::Relaxed);
        let next = self.next_index(write);
        let mut fresh = true;
        if next == self.read_index.load(Ordering::Acquire) {
            // Full: displace the oldest element and report the overwrite.
            self.pop_one();
            fresh = false;
        }
        // SAFETY: slot `write` is outside the occupied span, this is the
        // single producer.
        unsafe { std::ptr::write(self.slot_ptr(write), element) };
        self.write_index.store(next, Ordering::Release);
        fresh
    }

    fn read(&self) -> Option<F> {
        loop {
            let read = self.read_index.load(Ordering::Relaxed);
            if read == self.write_index.load(Ordering::Acquire) {
                return None;
            }
            let next = self.next_index(read);
            // SAFETY: read the element out before publishing the slot as
            // free; the CAS below makes this thread its unique owner.
            let element = unsafe { std::ptr::read(self.slot_ptr(read)) };
            if self
                .read_index
                .compare_exchange(read, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(element);
            }
            // Lost the race: another popper owns the slot now. Forget the
            // aliasing copy and retry.
            std::mem::forget(element);
        }
    }

    fn pop(&self, count: usize) -> usize {
        let mut popped = 0;
        while popped < count && self.pop_one() {
            popped += 1;
        }
        popped
    }

    fn front_timestamp(&self) -> Option<Timestamp> {
        let read = self.read_index.load(Ordering::Relaxed);
        if read == self.write_index.load(Ordering::Acquire) {
            return None;
        }
        Some(self.timestamp_at(read))
    }

    fn back_timestamp(&self) -> Option<Timestamp> {
        let write = self.write_index.load(Ordering::Acquire);
        if write == self.read_index.load(Ordering::Relaxed) {
            return None;
        }
        Some(self.timestamp_at(self.prev_index(write)))
    }

    fn back_frame_ptr(&self) -> Option<*const F> {
        let write = self.write_index.load(Ordering::Acquire);
        if write == self.read_index.load(Ordering::Relaxed) {
            return None;
        }
        Some(self.slot_ptr(self.prev_index(write)) as *const F)
    }

    fn for_each_from(
        &self,
        start: LookupStart,
        with_errors: bool,
        visit: &mut dyn FnMut(&F) -> ControlFlow<()>,
    ) -> bool {
        let begin = match start {
            LookupStart::Begin => {
                let read = self.read_index.load(Ordering::Relaxed);
                if read == self.write_index.load(Ordering::Acquire) {
                    return false;
                }
                read
            }
            LookupStart::Key(key) => match self.lower_bound_index(key, with_errors) {
                Some(index) => index,
                None => return false,
            },
        };
        let write = self.write_index.load(Ordering::Acquire);
        let mut index = begin;
        while index != write {
            // SAFETY: index walks the occupied span observed above; see the
            // module-level concurrency contract for staleness.
            let element = unsafe { &*self.slot_ptr(index) };
            if let ControlFlow::Break(()) = visit(element) {
                break;
            }
            index = self.next_index(index);
        }
        true
    }

    fn alignment_size(&self) -> usize {
        BUFFER_ALIGNMENT
    }

    fn contiguous_region(&self) -> Option<BufferRegion> {
        Some(BufferRegion {
            start: self.storage.as_ptr() as *const u8,
            len: self.slots * std::mem::size_of::<F>(),
            element_size: std::mem::size_of::<F>(),
        })
    }
}

impl<F: FrameType> Drop for RingLatencyBuffer<F> {
    fn drop(&mut self) {
        self.flush();
        // SAFETY: allocated in `new` with the stored layout.
        unsafe { alloc::dealloc(self.storage.as_ptr() as *mut u8, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::DummyFrame;

    fn ring(capacity: usize, fixed_rate: bool) -> RingLatencyBuffer<DummyFrame> {
        let cfg = LatencyBufferConfig {
            size: capacity,
            fixed_rate_lookup: fixed_rate,
        };
        RingLatencyBuffer::new(&cfg, SourceId::default()).unwrap()
    }

    fn fill(buffer: &RingLatencyBuffer<DummyFrame>, timestamps: &[u64]) {
        for (i, ts) in timestamps.iter().enumerate() {
            buffer.write(DummyFrame::new(*ts, i as u64));
        }
    }

    fn visited_from(
        buffer: &RingLatencyBuffer<DummyFrame>,
        key: u64,
        with_errors: bool,
    ) -> Option<Vec<u64>> {
        let mut seen = Vec::new();
        let found = buffer.for_each_from(LookupStart::Key(key), with_errors, &mut |f| {
            seen.push(f.timestamp());
            ControlFlow::Continue(())
        });
        found.then_some(seen)
    }

    #[test]
    fn test_empty_lookup_returns_end() {
        let buffer = ring(10, false);
        assert!(visited_from(&buffer, 0, false).is_none());
        assert!(visited_from(&buffer, 0, true).is_none());
        assert_eq!(buffer.occupancy(), 0);
        assert_eq!(buffer.front_timestamp(), None);
    }

    #[test]
    fn test_lower_bound_exact_and_between() {
        let buffer = ring(10, false);
        fill(&buffer, &[0, 1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000]);
        assert_eq!(visited_from(&buffer, 2000, false).unwrap()[0], 2000);
        assert_eq!(visited_from(&buffer, 1500, false).unwrap()[0], 2000);
        assert_eq!(visited_from(&buffer, 0, false).unwrap().len(), 10);
        assert_eq!(visited_from(&buffer, 9000, false).unwrap(), vec![9000]);
    }

    #[test]
    fn test_key_past_back_is_end() {
        let buffer = ring(10, false);
        fill(&buffer, &[0, 1000, 2000]);
        assert!(visited_from(&buffer, 2001, false).is_none());
        assert!(visited_from(&buffer, 2001, true).is_none());
    }

    #[test]
    fn test_key_before_front_needs_errors_flag() {
        let buffer = ring(4, false);
        fill(&buffer, &[0, 1000, 2000, 3000, 4000, 5000]); // wraps, front = 2000
        assert_eq!(buffer.front_timestamp(), Some(2000));
        assert!(visited_from(&buffer, 500, false).is_none());
        let widened = visited_from(&buffer, 500, true).unwrap();
        assert_eq!(widened[0], 2000);
    }

    #[test]
    fn test_write_reports_overwrite_and_keeps_capacity() {
        let buffer = ring(4, false);
        for i in 0..4u64 {
            assert!(buffer.write(DummyFrame::new(i * 1000, i)));
        }
        assert!(!buffer.write(DummyFrame::new(4000, 4)));
        assert_eq!(buffer.occupancy(), 4);
        assert_eq!(buffer.front_timestamp(), Some(1000));
        assert_eq!(buffer.back_timestamp(), Some(4000));
    }

    #[test]
    fn test_lookup_idempotent_without_writes() {
        let buffer = ring(10, false);
        fill(&buffer, &[0, 1000, 2000, 3000]);
        let first = visited_from(&buffer, 1200, false).unwrap();
        let second = visited_from(&buffer, 1200, false).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fixed_rate_matches_binary_search() {
        let plain = ring(64, false);
        let fast = ring(64, true);
        let timestamps: Vec<u64> = (0..64).map(|i| i * 1000).collect();
        fill(&plain, &timestamps);
        fill(&fast, &timestamps);
        for key in [0, 1, 999, 1000, 31_500, 62_999, 63_000] {
            assert_eq!(
                visited_from(&plain, key, false),
                visited_from(&fast, key, false),
                "key={key}"
            );
        }
        assert!(visited_from(&fast, 63_001, false).is_none());
    }

    #[test]
    fn test_fixed_rate_falls_back_on_gaps() {
        let fast = ring(16, true);
        // A dropped-frame gap breaks the constant-stride assumption.
        fill(&fast, &[0, 1000, 5000, 6000, 7000]);
        assert_eq!(visited_from(&fast, 4500, false).unwrap()[0], 5000);
        assert_eq!(visited_from(&fast, 900, false).unwrap()[0], 1000);
    }

    #[test]
    fn test_read_pops_front_in_order() {
        let buffer = ring(8, false);
        fill(&buffer, &[0, 1000, 2000]);
        assert_eq!(buffer.read().map(|f| f.timestamp()), Some(0));
        assert_eq!(buffer.read().map(|f| f.timestamp()), Some(1000));
        assert_eq!(buffer.occupancy(), 1);
        assert_eq!(buffer.pop(5), 1);
        assert!(buffer.read().is_none());
    }

    #[test]
    fn test_flush_empties() {
        let buffer = ring(8, false);
        fill(&buffer, &[0, 1000, 2000, 3000]);
        buffer.flush();
        assert_eq!(buffer.occupancy(), 0);
        assert!(buffer.back_frame_ptr().is_none());
    }

    #[test]
    fn test_region_is_page_aligned() {
        let buffer = ring(255, false);
        let region = buffer.contiguous_region().unwrap();
        assert_eq!(region.start as usize % BUFFER_ALIGNMENT, 0);
        assert_eq!(region.element_size, DummyFrame::ELEMENT_SIZE);
        assert_eq!(region.len, 256 * DummyFrame::ELEMENT_SIZE);
        assert_eq!(buffer.alignment_size(), BUFFER_ALIGNMENT);
    }

    #[test]
    fn test_visit_breaks_early() {
        let buffer = ring(10, false);
        fill(&buffer, &[0, 1000, 2000, 3000, 4000]);
        let mut seen = Vec::new();
        buffer.for_each_from(LookupStart::Key(1000), false, &mut |f| {
            if f.timestamp() >= 3000 {
                return ControlFlow::Break(());
            }
            seen.push(f.timestamp());
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec![1000, 2000]);
    }
}
