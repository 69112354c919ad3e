use crate::clock::{Clock, MonotonicClock};
use crate::event_loop::EventLoop;
use crate::sink::{ErrorSink, TracingSink};
use std::rc::Rc;

/// Fluent configuration for an [`EventLoop`].
///
/// ```ignore
/// let lp = EventLoop::builder()
///     .clock(ManualClock::new())
///     .max_ticks(10_000)
///     .build();
/// ```
pub struct LoopBuilder {
    clock: Option<Rc<dyn Clock>>,
    sink: Option<Rc<dyn ErrorSink>>,
    max_ticks: Option<u64>,
}

impl LoopBuilder {
    pub fn new() -> Self {
        Self {
            clock: None,
            sink: None,
            max_ticks: None,
        }
    }

    /// Time source for timers. Defaults to [`MonotonicClock`].
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Rc::new(clock));
        self
    }

    /// Where caught callback errors go. Defaults to [`TracingSink`].
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.sink = Some(Rc::new(sink));
        self
    }

    /// Upper bound on ticks per `run()`; exceeding it is an error.
    /// Handy in tests that might otherwise spin forever.
    pub fn max_ticks(mut self, limit: u64) -> Self {
        self.max_ticks = Some(limit);
        self
    }

    pub fn build(self) -> EventLoop {
        let clock = self
            .clock
            .unwrap_or_else(|| Rc::new(MonotonicClock::new()));
        let sink = self.sink.unwrap_or_else(|| Rc::new(TracingSink));
        EventLoop::from_parts(clock, sink, self.max_ticks)
    }
}

impl Default for LoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
