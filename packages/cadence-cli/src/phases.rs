//! Phase-ordering walkthrough: an interval that, on each firing, arms a
//! zero-delay timer, issues an I/O request and an immediate, each of which
//! queues a microtask. The printed trace shows where every callback lands.

use anyhow::Result;
use cadence_scheduler::{Clock, EventLoop, LoopBuilder, TimerHandle};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

type Trace = Rc<RefCell<Vec<String>>>;

fn record(trace: &Trace, lp: &EventLoop, message: impl AsRef<str>) {
    let phase = lp.current_phase().map_or("mainline", |phase| phase.as_str());
    trace
        .borrow_mut()
        .push(format!("[{:>4}ms] {:<9} {}", lp.now(), phase, message.as_ref()));
}

fn record_microtask(trace: &Trace, lp: &EventLoop, origin: &'static str) {
    let trace = trace.clone();
    lp.queue_microtask(move |lp| record(&trace, lp, format!("microtask queued by {origin}")));
}

/// Runs the walkthrough for `iterations` interval firings and returns the
/// trace, one line per callback.
pub fn walkthrough(clock: impl Clock + 'static, iterations: u32) -> Result<Vec<String>> {
    let lp = LoopBuilder::new().clock(clock).build();
    let trace: Trace = Rc::new(RefCell::new(Vec::new()));

    record_microtask(&trace, &lp, "mainline");
    record(&trace, &lp, "START");

    let fired = Rc::new(Cell::new(0u32));
    let handle: Rc<Cell<Option<TimerHandle>>> = Rc::new(Cell::new(None));
    let interval = {
        let trace = trace.clone();
        let handle = handle.clone();
        lp.set_interval(0, move |lp| {
            let iteration = fired.get();
            record(&trace, lp, format!("START iteration {iteration}"));

            if iteration < iterations {
                let timer_trace = trace.clone();
                lp.set_timeout(0, move |lp| {
                    record(&timer_trace, lp, format!("timer from iteration {iteration} expired"));
                    record_microtask(&timer_trace, lp, "timer");
                });

                let io_trace = trace.clone();
                lp.enqueue_io(move |lp| {
                    record(&io_trace, lp, "simulated read completed");
                    record_microtask(&io_trace, lp, "io");
                });

                let check_trace = trace.clone();
                lp.set_immediate(move |lp| {
                    record(&check_trace, lp, "immediate");
                    record_microtask(&check_trace, lp, "immediate");
                });
            } else {
                record(&trace, lp, "iteration limit reached, clearing interval");
                if let Some(handle) = handle.get() {
                    if let Err(error) = lp.cancel_timer(handle) {
                        tracing::warn!(%error, "interval already gone");
                    }
                }
            }

            record(&trace, lp, format!("END iteration {iteration}"));
            fired.set(iteration + 1);
        })
    };
    handle.set(Some(interval));

    record(&trace, &lp, "END");

    let stats = lp.run()?;
    tracing::debug!(ticks = stats.ticks, callbacks = stats.callbacks_run, "walkthrough finished");
    let lines = trace.take();
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_scheduler::ManualClock;

    fn messages(lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .map(|line| line.split_once("] ").map_or(line.as_str(), |(_, rest)| rest).to_string())
            .map(|rest| rest.split_whitespace().collect::<Vec<_>>().join(" "))
            .collect()
    }

    #[test]
    fn test_walkthrough_phase_order() {
        let lines = walkthrough(ManualClock::new(), 1).unwrap();

        assert_eq!(
            messages(&lines),
            vec![
                "mainline START",
                "mainline END",
                "microtask microtask queued by mainline",
                "timer START iteration 0",
                "timer END iteration 0",
                "io simulated read completed",
                "microtask microtask queued by io",
                "check immediate",
                "microtask microtask queued by immediate",
                "timer timer from iteration 0 expired",
                "microtask microtask queued by timer",
                "timer START iteration 1",
                "timer iteration limit reached, clearing interval",
                "timer END iteration 1",
            ]
        );
    }
}
