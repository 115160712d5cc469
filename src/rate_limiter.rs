//! Deadline-based pacing for the source emulator.
//!
//! The limiter keeps a running deadline one period ahead of the paced loop.
//! When the loop falls behind by more than the overshoot tolerance the
//! deadline resets to `now + period`: missed ticks are dropped rather than
//! caught up, so a stalled task never bursts. Intended only for tasks that
//! complete in well under `1 / rate`.
//!
//! ```
//! use daq_readout::rate_limiter::RateLimiter;
//!
//! let mut limiter = RateLimiter::new(100.0); // 100 kHz
//! for _ in 0..10 {
//!     // do work shorter than 10 µs
//!     limiter.limit();
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Tolerated overshoot before the deadline resets instead of sleeping.
const MAX_OVERSHOOT: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct RateLimiter {
    /// Period between ticks, in nanoseconds. Atomic so another thread can
    /// re-tune the rate mid-run through a shared reference.
    period_ns: AtomicU64,
    deadline: Instant,
}

impl RateLimiter {
    /// Creates a limiter ticking at `kilohertz` and arms the first deadline.
    pub fn new(kilohertz: f64) -> Self {
        let limiter = Self {
            period_ns: AtomicU64::new(Self::period_ns_for(kilohertz)),
            deadline: Instant::now(),
        };
        limiter.init_deadline()
    }

    fn period_ns_for(kilohertz: f64) -> u64 {
        (1_000_000.0 / kilohertz) as u64
    }

    fn init_deadline(mut self) -> Self {
        self.deadline = Instant::now() + self.period();
        self
    }

    /// Re-arms the deadline; call when the paced loop (re)starts.
    pub fn init(&mut self) {
        self.deadline = Instant::now() + self.period();
    }

    /// Adjusts the rate. Takes effect on the next tick.
    pub fn adjust(&self, kilohertz: f64) {
        self.period_ns
            .store(Self::period_ns_for(kilohertz), Ordering::Relaxed);
    }

    fn period(&self) -> Duration {
        Duration::from_nanos(self.period_ns.load(Ordering::Relaxed))
    }

    /// Blocks until the current deadline, then advances it one period.
    pub fn limit(&mut self) {
        let now = Instant::now();
        if now > self.deadline + MAX_OVERSHOOT {
            // Too far behind: drop the missed ticks.
            self.deadline = now + self.period();
            return;
        }
        if let Some(remaining) = self.deadline.checked_duration_since(now) {
            if !remaining.is_zero() {
                std::thread::sleep(remaining);
            }
            // Sleep may wake marginally early; spin out the remainder.
            while Instant::now() < self.deadline {
                std::hint::spin_loop();
            }
        }
        self.deadline += self.period();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paces_to_roughly_the_configured_rate() {
        // 10 kHz -> 100 µs period, 50 ticks ≈ 5 ms.
        let mut limiter = RateLimiter::new(10.0);
        limiter.init();
        let start = Instant::now();
        for _ in 0..50 {
            limiter.limit();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(4), "{elapsed:?}");
        // Generous upper bound for loaded CI machines.
        assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    }

    #[test]
    fn test_overshoot_resets_instead_of_bursting() {
        let mut limiter = RateLimiter::new(1_000.0); // 1 µs period
        limiter.init();
        std::thread::sleep(Duration::from_millis(30));
        // Way past the deadline: the next two calls must not replay the
        // ~30000 missed ticks back-to-back for free.
        let start = Instant::now();
        limiter.limit();
        limiter.limit();
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn test_adjust_changes_period() {
        let mut limiter = RateLimiter::new(1.0); // 1 kHz -> 1 ms
        limiter.adjust(1_000.0); // 1 MHz -> 1 µs
        limiter.init();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.limit();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
