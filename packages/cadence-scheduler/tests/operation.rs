use cadence_scheduler::{
    AlreadySettled, AsyncOperation, Clock, EventLoop, ManualClock, OperationStatus, Phase,
};
use std::cell::RefCell;
use std::rc::Rc;

fn manual_loop() -> EventLoop {
    EventLoop::builder().clock(ManualClock::new()).build()
}

#[test]
fn test_settles_exactly_once() {
    let lp = manual_loop();
    let op: AsyncOperation<u32, String> = lp.create_operation();

    assert_eq!(op.complete(1), Ok(()));
    let second = op.complete(2);
    let third = op.fail("late".to_string());

    let expected = AlreadySettled {
        id: op.id(),
        status: OperationStatus::Completed,
    };
    assert_eq!(second, Err(expected));
    assert_eq!(third, Err(expected));
    assert_eq!(op.result(), Some(1));
    assert_eq!(op.error(), None);
}

#[test]
fn test_fail_then_complete_keeps_failure() {
    let lp = manual_loop();
    let op: AsyncOperation<u32, String> = lp.create_operation();

    op.fail("disk".to_string()).unwrap();
    assert!(op.complete(9).is_err());
    assert_eq!(op.status(), OperationStatus::Failed);
    assert_eq!(op.error().as_deref(), Some("disk"));
    assert_eq!(op.result(), None);
}

#[test]
fn test_continuations_run_in_io_phase_in_registration_order() {
    let lp = manual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));
    let op: AsyncOperation<&'static str, String> = lp.create_operation();

    for name in ["first", "second"] {
        let log = log.clone();
        op.on_settled(move |lp, outcome| {
            assert_eq!(lp.current_phase(), Some(Phase::Io));
            log.borrow_mut().push(format!("{name}:{}", outcome.unwrap()));
        });
    }

    {
        let log = log.clone();
        let op = op.clone();
        lp.set_timeout(5, move |_| {
            op.complete("done").unwrap();
            log.borrow_mut().push("settled".to_string());
        });
    }

    lp.run().unwrap();

    assert_eq!(
        *log.borrow(),
        vec!["settled", "first:done", "second:done"]
    );
    assert_eq!(lp.pending_operations(), 0);
}

#[test]
fn test_on_settled_after_settlement_is_never_inline() {
    let lp = manual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));
    let op: AsyncOperation<u32, String> = AsyncOperation::completed(&lp, 3);

    {
        let log = log.clone();
        op.on_settled(move |_, outcome| log.borrow_mut().push(outcome));
    }
    assert!(log.borrow().is_empty());

    lp.run().unwrap();
    assert_eq!(*log.borrow(), vec![Ok(3)]);
}

#[test]
fn test_failure_reaches_every_continuation() {
    let lp = manual_loop();
    let errors = Rc::new(RefCell::new(Vec::new()));
    let op: AsyncOperation<u32, String> = lp.create_operation();

    for _ in 0..3 {
        let errors = errors.clone();
        op.on_settled(move |_, outcome| {
            if let Err(error) = outcome {
                errors.borrow_mut().push(error);
            }
        });
    }

    op.fail("unreachable".to_string()).unwrap();
    lp.run().unwrap();

    assert_eq!(errors.borrow().len(), 3);
    assert!(errors.borrow().iter().all(|e| e == "unreachable"));
}

#[test]
fn test_map_derives_a_new_operation() {
    let lp = manual_loop();
    let op: AsyncOperation<u32, String> = lp.create_operation();
    let doubled = op.map(&lp, |n| n * 2);
    let seen = Rc::new(RefCell::new(None));

    {
        let seen = seen.clone();
        doubled.on_settled(move |_, outcome| *seen.borrow_mut() = Some(outcome));
    }
    assert_eq!(lp.pending_operations(), 2);

    op.complete(21).unwrap();
    lp.run().unwrap();

    assert_eq!(doubled.result(), Some(42));
    assert_eq!(*seen.borrow(), Some(Ok(42)));
}

#[test]
fn test_map_err_converts_failure_and_passes_values() {
    let lp = manual_loop();
    let failing: AsyncOperation<u32, &'static str> = lp.create_operation();
    let passing: AsyncOperation<u32, &'static str> = lp.create_operation();
    let failing_mapped = failing.map_err(&lp, |e| e.len());
    let passing_mapped = passing.map_err(&lp, |e| e.len());

    failing.fail("four").unwrap();
    passing.complete(8).unwrap();
    lp.run().unwrap();

    assert_eq!(failing_mapped.error(), Some(4));
    assert_eq!(passing_mapped.result(), Some(8));
    assert_eq!(lp.pending_operations(), 0);
}

#[test]
fn test_settlement_from_microtask_resumes_in_same_tick_io_phase() {
    let lp = manual_loop();
    let log = Rc::new(RefCell::new(Vec::new()));
    let op: AsyncOperation<u32, String> = lp.create_operation();

    {
        let log = log.clone();
        op.on_settled(move |_, _| log.borrow_mut().push("continuation"));
    }
    {
        let op = op.clone();
        lp.queue_microtask(move |_| op.complete(1).unwrap());
    }
    {
        let log = log.clone();
        lp.set_immediate(move |_| log.borrow_mut().push("check"));
    }

    assert!(!lp.tick());
    assert_eq!(*log.borrow(), vec!["continuation", "check"]);
}

#[test]
fn test_map_result_settles_in_a_single_hop() {
    let lp = manual_loop();
    let op: AsyncOperation<u32, String> = lp.create_operation();
    let mapped = op.map_result(&lp, |outcome| match outcome {
        Ok(n) if n > 10 => Err(format!("{n} is too large")),
        Ok(n) => Ok(n.to_string()),
        Err(error) => Err(error),
    });

    op.complete(25).unwrap();
    lp.tick();

    assert_eq!(mapped.error().as_deref(), Some("25 is too large"));
    assert_eq!(lp.stats().operations_created, 2);
    assert!(lp.is_idle());
}

#[test]
fn test_and_then_waits_for_the_second_operation() {
    let (clock, lp) = {
        let clock = ManualClock::new();
        let lp = EventLoop::builder().clock(clock.clone()).build();
        (clock, lp)
    };
    let first: AsyncOperation<u32, String> = lp.create_operation();
    let calls = Rc::new(RefCell::new(Vec::new()));

    let chained = {
        let calls = calls.clone();
        first.and_then(&lp, move |lp, n| {
            calls.borrow_mut().push(n);
            let second: AsyncOperation<u32, String> = lp.create_operation();
            let target = second.clone();
            lp.set_timeout(5, move |_| target.complete(n * 10).unwrap());
            second
        })
    };

    first.complete(2).unwrap();
    lp.run().unwrap();

    assert_eq!(chained.result(), Some(20));
    assert_eq!(*calls.borrow(), vec![2]);
    assert_eq!(clock.now(), 5);
}

#[test]
fn test_and_then_skips_on_failure() {
    let lp = manual_loop();
    let first: AsyncOperation<u32, String> = lp.create_operation();
    let called = Rc::new(RefCell::new(false));

    let chained = {
        let called = called.clone();
        first.and_then(&lp, move |lp, n| {
            *called.borrow_mut() = true;
            AsyncOperation::completed(lp, n)
        })
    };

    first.fail("offline".to_string()).unwrap();
    lp.run().unwrap();

    assert_eq!(chained.error().as_deref(), Some("offline"));
    assert!(!*called.borrow());
}
