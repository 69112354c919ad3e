use crate::builder::LoopBuilder;
use crate::clock::Clock;
use crate::operation::{AsyncOperation, OperationId};
use crate::queue::{TaskQueue, TimerError, TimerHandle};
use crate::sink::ErrorSink;
use crate::task::{Callback, Phase, TaskError};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    #[error("event loop stalled: {pending} pending operation(s) and nothing left that could settle them")]
    Stalled { pending: usize },
    #[error("event loop exceeded its limit of {limit} ticks")]
    TickLimit { limit: u64 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    pub callbacks_run: u64,
    pub errors_reported: u64,
    pub operations_created: u64,
}

pub(crate) struct LoopInner {
    queue: TaskQueue<EventLoop>,
    clock: Rc<dyn Clock>,
    sink: RefCell<Rc<dyn ErrorSink>>,
    pending_operations: Cell<usize>,
    next_operation: Cell<u64>,
    stop_requested: Cell<bool>,
    current_phase: Cell<Option<Phase>>,
    stats: RefCell<LoopStats>,
    max_ticks: Option<u64>,
}

/// Single-threaded, phase-ordered event loop.
///
/// One tick runs the timer, I/O, check and close phases in that order and
/// drains the microtask queue after every callback. Handles are cheap to
/// clone; every callback receives `&EventLoop` so it can schedule more work.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning loop handle. Held by async operations and anything else
/// that must not keep its loop alive; `upgrade` fails once the loop is gone.
#[derive(Clone)]
pub struct WeakLoop(Weak<LoopInner>);

impl WeakLoop {
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.0.upgrade().map(|inner| EventLoop { inner })
    }
}

impl EventLoop {
    pub fn new() -> Self {
        LoopBuilder::new().build()
    }

    pub fn builder() -> LoopBuilder {
        LoopBuilder::new()
    }

    pub(crate) fn from_parts(
        clock: Rc<dyn Clock>,
        sink: Rc<dyn ErrorSink>,
        max_ticks: Option<u64>,
    ) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                queue: TaskQueue::new(clock.clone()),
                clock,
                sink: RefCell::new(sink),
                pending_operations: Cell::new(0),
                next_operation: Cell::new(0),
                stop_requested: Cell::new(false),
                current_phase: Cell::new(None),
                stats: RefCell::new(LoopStats::default()),
                max_ticks,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakLoop {
        WeakLoop(Rc::downgrade(&self.inner))
    }

    pub fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    pub fn queue(&self) -> &TaskQueue<EventLoop> {
        &self.inner.queue
    }

    // Scheduling

    pub fn enqueue<F>(&self, phase: Phase, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.inner
            .queue
            .enqueue(phase, Callback::new(f).with_label(phase.as_str()));
    }

    /// Enqueues a prepared callback, e.g. a labelled or fallible one.
    pub fn enqueue_task(&self, phase: Phase, task: Callback<EventLoop>) {
        self.inner.queue.enqueue(phase, task);
    }

    pub fn queue_microtask<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.enqueue(Phase::Microtask, f);
    }

    pub fn set_timeout<F>(&self, delay_ms: u64, f: F) -> TimerHandle
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.inner
            .queue
            .enqueue_timer(delay_ms, Callback::new(f).with_label("timeout"))
    }

    pub fn set_interval<F>(&self, period_ms: u64, mut f: F) -> TimerHandle
    where
        F: FnMut(&EventLoop) + 'static,
    {
        self.inner.queue.enqueue_interval(period_ms, move |lp| {
            f(lp);
            Ok(())
        })
    }

    pub fn cancel_timer(&self, handle: TimerHandle) -> Result<(), TimerError> {
        self.inner.queue.cancel_timer(handle)
    }

    pub fn enqueue_io<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.enqueue(Phase::Io, f);
    }

    /// Runs `f` in the check phase: right after the current (or next) I/O
    /// phase, before the next timer phase.
    pub fn set_immediate<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.enqueue(Phase::Check, f);
    }

    /// Registers end-of-tick cleanup; runs once, in the close phase.
    pub fn on_close<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop) + 'static,
    {
        self.enqueue(Phase::Close, f);
    }

    pub fn create_operation<T, E>(&self) -> AsyncOperation<T, E>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        AsyncOperation::new(self)
    }

    // Operation bookkeeping

    pub(crate) fn operation_created(&self) -> OperationId {
        let id = self.inner.next_operation.get();
        self.inner.next_operation.set(id + 1);
        self.inner
            .pending_operations
            .set(self.inner.pending_operations.get() + 1);
        self.inner.stats.borrow_mut().operations_created += 1;
        OperationId(id)
    }

    pub(crate) fn next_operation_id(&self) -> OperationId {
        let id = self.inner.next_operation.get();
        self.inner.next_operation.set(id + 1);
        self.inner.stats.borrow_mut().operations_created += 1;
        OperationId(id)
    }

    pub(crate) fn operation_settled(&self) {
        let pending = self.inner.pending_operations.get();
        self.inner
            .pending_operations
            .set(pending.saturating_sub(1));
    }

    pub fn pending_operations(&self) -> usize {
        self.inner.pending_operations.get()
    }

    // Errors

    pub fn set_error_sink(&self, sink: impl ErrorSink + 'static) {
        *self.inner.sink.borrow_mut() = Rc::new(sink);
    }

    /// Hands an error to the registered sink and counts it. Pass
    /// [`current_phase`](Self::current_phase) for errors caught outside the
    /// loop's own callbacks; `None` marks mainline code.
    pub fn report_error(&self, error: &TaskError, phase: Option<Phase>, callback: &str) {
        self.inner.stats.borrow_mut().errors_reported += 1;
        let sink = self.inner.sink.borrow().clone();
        sink.report(error, phase, callback);
    }

    // Driving

    /// Phase currently executing, if a tick is in progress.
    pub fn current_phase(&self) -> Option<Phase> {
        self.inner.current_phase.get()
    }

    /// No queued work and no pending operations.
    pub fn is_idle(&self) -> bool {
        self.inner.queue.is_empty() && self.pending_operations() == 0
    }

    /// Asks `run()` to return once the current tick completes.
    pub fn stop(&self) {
        tracing::debug!("stop requested");
        self.inner.stop_requested.set(true);
    }

    pub fn stats(&self) -> LoopStats {
        self.inner.stats.borrow().clone()
    }

    /// Runs ticks until the loop is idle or `stop()` is called.
    ///
    /// When nothing is ready but a timer is armed, the clock is advanced to
    /// that timer's expiry. Pending operations with no queued work left to
    /// settle them are reported as [`LoopError::Stalled`].
    pub fn run(&self) -> Result<LoopStats, LoopError> {
        self.inner.stop_requested.set(false);
        let mut ticks = 0u64;

        loop {
            if self.inner.stop_requested.get() {
                tracing::debug!(ticks, "loop stopped");
                break;
            }
            if self.is_idle() {
                tracing::debug!(ticks, "loop idle");
                break;
            }

            if !self.inner.queue.has_ready_work(self.now()) {
                match self.inner.queue.next_expiry() {
                    Some(deadline) => {
                        tracing::trace!(deadline, "waiting for next timer");
                        self.inner.clock.advance_to(deadline);
                    }
                    None => {
                        let pending = self.pending_operations();
                        tracing::warn!(pending, "loop stalled on pending operations");
                        return Err(LoopError::Stalled { pending });
                    }
                }
            }

            if let Some(limit) = self.inner.max_ticks {
                if ticks >= limit {
                    return Err(LoopError::TickLimit { limit });
                }
            }

            self.tick();
            ticks += 1;
        }

        self.inner.stop_requested.set(false);
        Ok(self.stats())
    }

    /// Runs exactly one tick. Returns whether any work remains afterwards.
    pub fn tick(&self) -> bool {
        let tick = {
            let mut stats = self.inner.stats.borrow_mut();
            stats.ticks += 1;
            stats.ticks
        };
        let _span = tracing::debug_span!("tick", tick).entered();

        // Work queued from outside a tick gets its microtasks first.
        self.drain_microtasks();

        self.inner.current_phase.set(Some(Phase::Timer));
        let now = self.now();
        for ready in self.inner.queue.dequeue_ready_timers(now) {
            self.run_phase_callback(Phase::Timer, ready.callback);
        }

        self.inner.current_phase.set(Some(Phase::Io));
        for task in self.inner.queue.dequeue_all_io() {
            self.run_phase_callback(Phase::Io, task);
        }

        // Taken after the I/O phase so immediates queued there run this tick.
        self.inner.current_phase.set(Some(Phase::Check));
        for task in self.inner.queue.dequeue_all_check() {
            self.run_phase_callback(Phase::Check, task);
        }

        self.inner.current_phase.set(Some(Phase::Close));
        for task in self.inner.queue.dequeue_all_close() {
            self.run_phase_callback(Phase::Close, task);
        }

        self.inner.current_phase.set(None);
        !self.is_idle()
    }

    fn run_phase_callback(&self, phase: Phase, task: Callback<EventLoop>) {
        self.execute(phase, task);
        self.drain_microtasks();
    }

    fn drain_microtasks(&self) {
        let previous = self.inner.current_phase.get();
        self.inner
            .queue
            .drain_microtasks(|task| self.execute(Phase::Microtask, task));
        self.inner.current_phase.set(previous);
    }

    fn execute(&self, phase: Phase, task: Callback<EventLoop>) {
        let (label, body) = task.into_parts();
        tracing::trace!(%phase, callback = %label, "running callback");
        self.inner.stats.borrow_mut().callbacks_run += 1;
        self.inner.current_phase.set(Some(phase));

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| body(self))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::from_panic(payload)),
        };
        if let Err(error) = outcome {
            self.report_error(&error, Some(phase), &label);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_empty_loop_is_idle() {
        let lp = EventLoop::builder().clock(ManualClock::new()).build();
        assert!(lp.is_idle());
        assert!(!lp.tick());
        assert_eq!(lp.run(), Ok(lp.stats()));
    }

    #[test]
    fn test_current_phase_visible_to_callbacks() {
        let lp = EventLoop::builder().clock(ManualClock::new()).build();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = seen.clone();
            lp.set_immediate(move |lp| {
                seen.borrow_mut().push(lp.current_phase());
                let seen = seen.clone();
                lp.queue_microtask(move |lp| seen.borrow_mut().push(lp.current_phase()));
            });
        }
        lp.run().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![Some(Phase::Check), Some(Phase::Microtask)]
        );
        assert_eq!(lp.current_phase(), None);
    }
}
