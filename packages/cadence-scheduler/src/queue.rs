use crate::clock::Clock;
use crate::task::{Callback, Phase, TaskError};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use thiserror::Error;

new_key_type! {
    /// Identifies an armed timer for cancellation.
    pub struct TimerHandle;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    /// The entry is gone: it fired, or it was canceled earlier and has
    /// since been reaped.
    #[error("timer {0:?} already fired")]
    AlreadyFired(TimerHandle),
}

/// Expiry first, arming order second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimerKey {
    expiry: u64,
    seq: u64,
}

type RepeatFn<Cx> = Rc<RefCell<Box<dyn FnMut(&Cx) -> Result<(), TaskError>>>>;

enum TimerKind<Cx> {
    Once(Callback<Cx>),
    Repeat { period: u64, task: RepeatFn<Cx> },
}

struct TimerEntry<Cx> {
    delay_ms: u64,
    armed_at: u64,
    canceled: bool,
    kind: TimerKind<Cx>,
}

/// A timer removed from the queue because its expiry has passed.
#[derive(Debug)]
pub struct ReadyTimer<Cx> {
    pub handle: TimerHandle,
    pub expiry: u64,
    pub callback: Callback<Cx>,
}

struct Timers<Cx> {
    entries: SlotMap<TimerHandle, TimerEntry<Cx>>,
    // Canceled entries stay here until their expiry passes and they are reaped.
    order: BTreeMap<TimerKey, TimerHandle>,
    next_seq: u64,
    live: usize,
}

impl<Cx> Timers<Cx> {
    fn arm(&mut self, now: u64, delay_ms: u64, kind: TimerKind<Cx>) -> TimerHandle {
        let key = self.next_key(now, delay_ms);
        let handle = self.entries.insert(TimerEntry {
            delay_ms,
            armed_at: now,
            canceled: false,
            kind,
        });
        self.order.insert(key, handle);
        self.live += 1;
        handle
    }

    fn next_key(&mut self, now: u64, delay_ms: u64) -> TimerKey {
        TimerKey {
            expiry: now.saturating_add(delay_ms),
            seq: self.next_seq(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

/// Per-phase pending work for one event loop.
///
/// The loop is single-threaded, so every queue sits behind a `RefCell`.
/// No borrow is held while a callback runs, which is what lets callbacks
/// enqueue more work while their own phase is executing.
pub struct TaskQueue<Cx> {
    clock: Rc<dyn Clock>,
    microtasks: RefCell<VecDeque<Callback<Cx>>>,
    io: RefCell<VecDeque<Callback<Cx>>>,
    check: RefCell<VecDeque<Callback<Cx>>>,
    close: RefCell<VecDeque<Callback<Cx>>>,
    timers: RefCell<Timers<Cx>>,
}

impl<Cx: 'static> TaskQueue<Cx> {
    pub fn new(clock: Rc<dyn Clock>) -> Self {
        Self {
            clock,
            microtasks: RefCell::new(VecDeque::new()),
            io: RefCell::new(VecDeque::new()),
            check: RefCell::new(VecDeque::new()),
            close: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Timers {
                entries: SlotMap::with_key(),
                order: BTreeMap::new(),
                next_seq: 0,
                live: 0,
            }),
        }
    }

    /// Appends to the tail of `phase`'s queue. `Phase::Timer` arms a
    /// zero-delay timer.
    pub fn enqueue(&self, phase: Phase, callback: Callback<Cx>) {
        match phase {
            Phase::Microtask => self.microtasks.borrow_mut().push_back(callback),
            Phase::Io => self.io.borrow_mut().push_back(callback),
            Phase::Check => self.check.borrow_mut().push_back(callback),
            Phase::Close => self.close.borrow_mut().push_back(callback),
            Phase::Timer => {
                self.enqueue_timer(0, callback);
            }
        }
    }

    pub fn enqueue_timer(&self, delay_ms: u64, callback: Callback<Cx>) -> TimerHandle {
        let now = self.clock.now();
        let handle = self
            .timers
            .borrow_mut()
            .arm(now, delay_ms, TimerKind::Once(callback));
        tracing::trace!(?handle, delay_ms, armed_at = now, "timer armed");
        handle
    }

    /// Arms a timer that re-arms itself `period_ms` after each firing.
    /// Periods below 1 ms are raised to 1 ms so a zero period cannot
    /// become due again inside the pass that fired it.
    pub fn enqueue_interval<F>(&self, period_ms: u64, task: F) -> TimerHandle
    where
        F: FnMut(&Cx) -> Result<(), TaskError> + 'static,
    {
        let period = period_ms.max(1);
        let now = self.clock.now();
        let task: RepeatFn<Cx> = Rc::new(RefCell::new(Box::new(task)));
        let handle = self
            .timers
            .borrow_mut()
            .arm(now, period, TimerKind::Repeat { period, task });
        tracing::trace!(?handle, period, armed_at = now, "interval armed");
        handle
    }

    /// Marks the timer canceled. Canceling twice is fine; canceling a
    /// timer that already fired is reported.
    pub fn cancel_timer(&self, handle: TimerHandle) -> Result<(), TimerError> {
        let mut timers = self.timers.borrow_mut();
        let Some(entry) = timers.entries.get_mut(handle) else {
            return Err(TimerError::AlreadyFired(handle));
        };
        if !entry.canceled {
            entry.canceled = true;
            timers.live -= 1;
        }
        Ok(())
    }

    /// Runs every microtask through `run`, including ones enqueued while
    /// draining, until the queue is empty. Returns how many ran.
    pub fn drain_microtasks(&self, mut run: impl FnMut(Callback<Cx>)) -> usize {
        let mut count = 0;
        loop {
            // Bind first so the borrow ends before `run` re-enters the queue.
            let next = self.microtasks.borrow_mut().pop_front();
            match next {
                Some(task) => {
                    run(task);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Removes and returns every live timer with `armed_at + delay <= now`,
    /// ordered by expiry then arming order. Canceled entries encountered on
    /// the way are reaped. Intervals are re-armed relative to `now`, so they
    /// never reappear in the list they fired from.
    pub fn dequeue_ready_timers(&self, now: u64) -> Vec<ReadyTimer<Cx>> {
        let mut guard = self.timers.borrow_mut();
        let timers = &mut *guard;
        let mut ready = Vec::new();
        let mut rearm: SmallVec<[TimerHandle; 4]> = SmallVec::new();

        while let Some(first) = timers.order.first_entry() {
            if first.key().expiry > now {
                break;
            }
            let (key, handle) = first.remove_entry();

            let Some(entry) = timers.entries.get(handle) else {
                continue;
            };
            if entry.canceled {
                timers.entries.remove(handle);
                tracing::trace!(?handle, "canceled timer reaped");
                continue;
            }

            let repeat = match &entry.kind {
                TimerKind::Repeat { task, .. } => Some(task.clone()),
                TimerKind::Once(_) => None,
            };

            match repeat {
                Some(task) => {
                    ready.push(ReadyTimer {
                        handle,
                        expiry: key.expiry,
                        callback: Callback::fallible(move |cx: &Cx| {
                            let mut task = task.borrow_mut();
                            (*task)(cx)
                        })
                        .with_label("interval"),
                    });
                    rearm.push(handle);
                }
                None => {
                    if let Some(TimerEntry {
                        kind: TimerKind::Once(callback),
                        ..
                    }) = timers.entries.remove(handle)
                    {
                        timers.live -= 1;
                        ready.push(ReadyTimer {
                            handle,
                            expiry: key.expiry,
                            callback,
                        });
                    }
                }
            }
        }

        for handle in rearm {
            let seq = timers.next_seq();
            if let Some(entry) = timers.entries.get_mut(handle) {
                if let TimerKind::Repeat { period, .. } = entry.kind {
                    let key = TimerKey {
                        expiry: now.saturating_add(period),
                        seq,
                    };
                    entry.armed_at = now;
                    entry.delay_ms = period;
                    timers.order.insert(key, handle);
                }
            }
        }

        ready
    }

    pub fn dequeue_all_io(&self) -> VecDeque<Callback<Cx>> {
        std::mem::take(&mut *self.io.borrow_mut())
    }

    pub fn dequeue_all_check(&self) -> VecDeque<Callback<Cx>> {
        std::mem::take(&mut *self.check.borrow_mut())
    }

    pub fn dequeue_all_close(&self) -> VecDeque<Callback<Cx>> {
        std::mem::take(&mut *self.close.borrow_mut())
    }

    /// Earliest expiry among timers that are still live.
    pub fn next_expiry(&self) -> Option<u64> {
        let timers = self.timers.borrow();
        timers
            .order
            .iter()
            .find(|(_, handle)| {
                timers
                    .entries
                    .get(**handle)
                    .is_some_and(|entry| !entry.canceled)
            })
            .map(|(key, _)| key.expiry)
    }

    /// Whether a tick started at `now` would find anything to run.
    pub fn has_ready_work(&self, now: u64) -> bool {
        !self.microtasks.borrow().is_empty()
            || !self.io.borrow().is_empty()
            || !self.check.borrow().is_empty()
            || !self.close.borrow().is_empty()
            || self.next_expiry().is_some_and(|expiry| expiry <= now)
    }

    /// Number of entries waiting in `phase`. Timers count live entries only.
    pub fn len(&self, phase: Phase) -> usize {
        match phase {
            Phase::Microtask => self.microtasks.borrow().len(),
            Phase::Io => self.io.borrow().len(),
            Phase::Check => self.check.borrow().len(),
            Phase::Close => self.close.borrow().len(),
            Phase::Timer => self.timers.borrow().live,
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            Phase::Microtask,
            Phase::Timer,
            Phase::Io,
            Phase::Check,
            Phase::Close,
        ]
        .iter()
        .all(|phase| self.len(*phase) == 0)
    }

    /// `(armed_at, delay_ms)` for a timer that has not fired yet.
    pub fn timer_info(&self, handle: TimerHandle) -> Option<(u64, u64)> {
        self.timers
            .borrow()
            .entries
            .get(handle)
            .map(|entry| (entry.armed_at, entry.delay_ms))
    }
}
