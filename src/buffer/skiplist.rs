//! Skip-list latency buffer for out-of-order producers.
//!
//! Trigger-primitive streams arrive out of timestamp order, so the ring's
//! append-only discipline does not hold. This variant keeps elements in a
//! lock-free ordered skip list: inserts land in timestamp order wherever
//! they belong, and the lookup is a logarithmic range scan. Entries are
//! reclaimed epoch-based after removal, so references handed to visitors
//! stay valid for as long as the cleanup gate keeps pops away.

use std::ops::{Bound, ControlFlow};

use crossbeam_skiplist::SkipSet;
use tracing::debug;

use super::{LatencyBuffer, LookupStart};
use crate::config::LatencyBufferConfig;
use crate::error::Result;
use crate::frame::FrameType;
use crate::types::{SourceId, Timestamp};

pub struct SkipListLatencyBuffer<F: FrameType> {
    set: SkipSet<F>,
    capacity: usize,
}

impl<F: FrameType> SkipListLatencyBuffer<F> {
    /// Inserts preserving order; used by tests and out-of-order producers
    /// directly.
    pub fn put(&self, element: F) -> bool {
        self.write(element)
    }
}

impl<F: FrameType> LatencyBuffer<F> for SkipListLatencyBuffer<F> {
    fn new(cfg: &LatencyBufferConfig, sourceid: SourceId) -> Result<Self> {
        cfg.validate(sourceid)?;
        debug!(capacity = cfg.size, "initialized skip-list latency buffer");
        Ok(Self {
            set: SkipSet::new(),
            capacity: cfg.size,
        })
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn occupancy(&self) -> usize {
        self.set.len()
    }

    fn write(&self, element: F) -> bool {
        if self.set.len() >= self.capacity {
            // The arena is exhausted; the element is not stored.
            return false;
        }
        if self.set.contains(&element) {
            // Duplicate key: the stored element wins, the write is reported.
            return false;
        }
        self.set.insert(element);
        true
    }

    fn read(&self) -> Option<F> {
        self.set.pop_front().map(|entry| entry.value().clone())
    }

    fn pop(&self, count: usize) -> usize {
        let mut popped = 0;
        while popped < count && self.set.pop_front().is_some() {
            popped += 1;
        }
        popped
    }

    fn front_timestamp(&self) -> Option<Timestamp> {
        self.set.front().map(|entry| entry.value().timestamp())
    }

    fn back_timestamp(&self) -> Option<Timestamp> {
        self.set.back().map(|entry| entry.value().timestamp())
    }

    fn back_frame_ptr(&self) -> Option<*const F> {
        self.set.back().map(|entry| entry.value() as *const F)
    }

    fn for_each_from(
        &self,
        start: LookupStart,
        with_errors: bool,
        visit: &mut dyn FnMut(&F) -> ControlFlow<()>,
    ) -> bool {
        match start {
            LookupStart::Begin => {
                if self.set.is_empty() {
                    return false;
                }
                for entry in self.set.iter() {
                    if let ControlFlow::Break(()) = visit(entry.value()) {
                        break;
                    }
                }
                true
            }
            LookupStart::Key(key) => {
                let front_ts = match self.front_timestamp() {
                    Some(ts) => ts,
                    None => return false,
                };
                let back_ts = self.back_timestamp().unwrap_or(front_ts);
                if key > back_ts {
                    return false;
                }
                if key < front_ts && !with_errors {
                    return false;
                }
                let lookup = F::lookup_key(key);
                for entry in self.set.range((Bound::Included(&lookup), Bound::Unbounded)) {
                    if let ControlFlow::Break(()) = visit(entry.value()) {
                        break;
                    }
                }
                true
            }
        }
    }
}
