use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Time source injected into the protocol core.
///
/// The core never reads wall-clock time directly; everything it schedules
/// (interframe gaps, listen periods, token timeouts) is derived from this
/// trait so a simulated clock can drive it deterministically in tests.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn now_us(&self) -> u64;
}

/// Monotonic clock backed by `std::time::Instant`.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }
}

/// Manually-advanced clock for simulations.
///
/// Clones share the same underlying counter, so one `SimClock` can be handed
/// to every node on a virtual bus and advanced from the test harness.
#[derive(Clone)]
pub struct SimClock {
    micros: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            micros: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn advance_ms(&self, ms: u64) {
        self.micros.fetch_add(ms * 1_000, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.micros.fetch_add(us, Ordering::SeqCst);
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> u64 {
        self.micros.load(Ordering::SeqCst) / 1_000
    }

    fn now_us(&self) -> u64 {
        self.micros.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_shared_between_clones() {
        let clock = SimClock::new();
        let other = clock.clone();

        clock.advance_ms(42);
        assert_eq!(other.now_ms(), 42);
        assert_eq!(other.now_us(), 42_000);

        other.advance_us(500);
        assert_eq!(clock.now_us(), 42_500);
        assert_eq!(clock.now_ms(), 42);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
