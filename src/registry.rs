//! Registry of named frame-error intervals.
//!
//! Pre-processors that detect corrupt or missing frames publish the affected
//! timestamp interval here; the request handler only consults it to decide
//! whether the timestamp lookup may widen its search. The registry is purely
//! advisory and never blocks the data path beyond its internal mutex.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::Timestamp;

/// Error name used by pre-processors that detect gaps in the timestamp
/// sequence.
pub const MISSING_FRAMES: &str = "MISSING_FRAMES";

/// A half-open interval of timestamps affected by one error condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInterval {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
}

impl ErrorInterval {
    pub fn new(start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self { start_ts, end_ts }
    }
}

/// Maps an error name to its most recent interval. At most one interval is
/// active per name; re-adding replaces the previous one.
#[derive(Debug, Default)]
pub struct FrameErrorRegistry {
    errors: Mutex<HashMap<String, ErrorInterval>>,
}

impl FrameErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `interval` under `name`, replacing any existing entry.
    pub fn add_error(&self, name: &str, interval: ErrorInterval) {
        let mut errors = self.errors.lock();
        if !errors.contains_key(name) {
            debug!(name, "encountered new frame error");
        }
        errors.insert(name.to_owned(), interval);
    }

    /// Retires every interval that ended before `ts`. Called after cleanups
    /// once the buffer front has advanced.
    pub fn remove_errors_until(&self, ts: Timestamp) {
        let mut errors = self.errors.lock();
        errors.retain(|name, interval| {
            let keep = ts <= interval.end_ts;
            if !keep {
                debug!(name, end_ts = interval.end_ts, "retired frame error");
            }
            keep
        });
    }

    pub fn has_error(&self, name: &str) -> bool {
        self.errors.lock().contains_key(name)
    }

    pub fn has_any_error(&self) -> bool {
        !self.errors.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let registry = FrameErrorRegistry::new();
        assert!(!registry.has_any_error());
        registry.add_error(MISSING_FRAMES, ErrorInterval::new(1_000, 5_000));
        assert!(registry.has_error(MISSING_FRAMES));
        assert!(!registry.has_error("BAD_CRC"));
    }

    #[test]
    fn test_replaces_interval_for_same_name() {
        let registry = FrameErrorRegistry::new();
        registry.add_error(MISSING_FRAMES, ErrorInterval::new(0, 100));
        registry.add_error(MISSING_FRAMES, ErrorInterval::new(200, 300));
        // The old interval is gone: advancing past 100 must not retire the
        // replacement.
        registry.remove_errors_until(150);
        assert!(registry.has_error(MISSING_FRAMES));
        registry.remove_errors_until(301);
        assert!(!registry.has_error(MISSING_FRAMES));
    }

    #[test]
    fn test_remove_errors_until_is_exclusive_of_end() {
        let registry = FrameErrorRegistry::new();
        registry.add_error("A", ErrorInterval::new(0, 1_000));
        registry.add_error("B", ErrorInterval::new(0, 2_000));
        registry.remove_errors_until(1_000);
        // end_ts == ts survives; only strictly older intervals retire.
        assert!(registry.has_error("A"));
        registry.remove_errors_until(1_001);
        assert!(!registry.has_error("A"));
        assert!(registry.has_error("B"));
    }
}
