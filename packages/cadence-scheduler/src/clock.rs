use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic millisecond time source for timer expiry.
///
/// Readings are only ever compared with each other; they carry no
/// wall-clock meaning.
pub trait Clock {
    /// Current reading in milliseconds. Never decreases.
    fn now(&self) -> u64;

    /// Let time pass until `deadline`.
    /// Called by the loop when the only remaining work is a future timer.
    fn advance_to(&self, deadline: u64);
}

/// Real time, measured from the moment the clock was created.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn advance_to(&self, deadline: u64) {
        let now = self.now();
        if deadline > now {
            std::thread::sleep(Duration::from_millis(deadline - now));
        }
    }
}

/// Virtual time that only moves when told to.
///
/// Clones share the same reading, so a test can keep one handle while the
/// loop owns another. `advance_to` jumps instead of sleeping, which lets a
/// loop with pending timers run to completion instantly.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Rc<Cell<u64>>);

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ms: u64) -> Self {
        Self(Rc::new(Cell::new(ms)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.set(self.0.get().saturating_add(ms));
    }

    /// Moves to `ms`; earlier readings are ignored to stay monotonic.
    pub fn set(&self, ms: u64) {
        if ms > self.0.get() {
            self.0.set(ms);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.get()
    }

    fn advance_to(&self, deadline: u64) {
        self.set(deadline);
    }
}
