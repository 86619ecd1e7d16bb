//! Monotonic clock abstraction
//!
//! Packet timestamps and polling timeouts are measured against a [`Clock`] so
//! tests can swap the wall clock for a [`SimulatedClock`] that only moves
//! when told to.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in microseconds since the clock's origin
    fn now_us(&self) -> i64;

    /// Let `step` of time pass.
    ///
    /// A real clock waits; a simulated clock advances its counter without
    /// blocking.
    fn step(&self, step: Duration);

    /// Current time in milliseconds
    fn now_ms(&self) -> i64 {
        self.now_us() / 1000
    }
}

/// Shared clock handle
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by [`Instant`]
#[derive(Debug)]
pub struct RealClock {
    origin: Instant,
}

impl RealClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn now_us(&self) -> i64 {
        self.origin.elapsed().as_micros() as i64
    }

    fn step(&self, step: Duration) {
        thread::sleep(step);
    }
}

/// Clock that advances only programmatically
#[derive(Debug, Default)]
pub struct SimulatedClock {
    now_us: AtomicI64,
}

impl SimulatedClock {
    pub fn new(start_us: i64) -> Self {
        Self {
            now_us: AtomicI64::new(start_us),
        }
    }

    pub fn shared(start_us: i64) -> Arc<Self> {
        Arc::new(Self::new(start_us))
    }

    /// Move time forward by `delta`
    pub fn advance(&self, delta: Duration) {
        self.now_us
            .fetch_add(delta.as_micros() as i64, Ordering::SeqCst);
    }

    /// Jump to an absolute time. Going backwards is ignored.
    pub fn set_time_us(&self, now_us: i64) {
        self.now_us.fetch_max(now_us, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now_us(&self) -> i64 {
        self.now_us.load(Ordering::SeqCst)
    }

    fn step(&self, step: Duration) {
        self.advance(step);
        // Give socket and context threads a chance to run without burning wall time.
        thread::yield_now();
    }
}
