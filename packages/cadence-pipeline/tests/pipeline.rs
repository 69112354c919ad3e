use cadence_pipeline::{
    Context, ErrorKind, Method, PipelineError, RequestPipeline, Responder, Response, Step,
    stage_fn,
};
use cadence_scheduler::{AsyncOperation, EventLoop, ManualClock, Phase, TaskError};
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

fn manual_loop() -> EventLoop {
    EventLoop::builder().clock(ManualClock::new()).build()
}

fn request(responses: &Rc<RefCell<Vec<Response>>>) -> Context {
    let responses = responses.clone();
    Context::new(
        1,
        Method::Get,
        "/lists/42",
        None,
        Responder::new(move |_, response| responses.borrow_mut().push(response)),
    )
}

/// An operation that fails with `error` after `delay_ms`.
fn failing_after(
    lp: &EventLoop,
    delay_ms: u64,
    error: PipelineError,
) -> AsyncOperation<Value, PipelineError> {
    let op: AsyncOperation<Value, PipelineError> = lp.create_operation();
    let target = op.clone();
    lp.set_timeout(delay_ms, move |_| {
        target.fail(error).unwrap();
    });
    op
}

fn completing_after(
    lp: &EventLoop,
    delay_ms: u64,
    value: Value,
) -> AsyncOperation<Value, PipelineError> {
    let op: AsyncOperation<Value, PipelineError> = lp.create_operation();
    let target = op.clone();
    lp.set_timeout(delay_ms, move |_| {
        target.complete(value).unwrap();
    });
    op
}

#[test]
fn test_failure_halts_remaining_stages() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let third_ran = Rc::new(Cell::new(false));

    let pipeline = {
        let third_ran = third_ran.clone();
        RequestPipeline::new()
            .stage(stage_fn("first", |lp, _, _| {
                Ok(Step::Await(completing_after(lp, 5, json!("ok"))))
            }))
            .stage(stage_fn("second", |lp, _, _| {
                Ok(Step::Await(failing_after(
                    lp,
                    5,
                    PipelineError::Datastore("connection reset".into()),
                )))
            }))
            .stage(stage_fn("third", move |_, _, _| {
                third_ran.set(true);
                Ok(Step::Respond(Response::ok(json!("unreachable"))))
            }))
    };

    pipeline.run(&lp, request(&responses));
    lp.run().unwrap();

    assert!(!third_ran.get());
    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind(), Some(ErrorKind::Datastore));
    assert_eq!(responses[0].status(), 500);
}

#[test]
fn test_not_found_skips_mutating_stage() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let mutated = Rc::new(Cell::new(false));

    let pipeline = {
        let mutated = mutated.clone();
        RequestPipeline::new()
            .stage(stage_fn("find", |lp, cx, _| {
                let id = cx.segments[1].clone();
                Ok(Step::Await(failing_after(
                    lp,
                    0,
                    PipelineError::not_found(format!("record {id}")),
                )))
            }))
            .stage(stage_fn("mutate", move |_, _, _| {
                mutated.set(true);
                Ok(Step::Continue(Value::Null))
            }))
    };

    pipeline.run(&lp, request(&responses));
    lp.run().unwrap();

    assert!(!mutated.get());
    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status(), 404);
    assert_eq!(responses[0].body(), json!({}));
}

#[test]
fn test_running_out_of_stages_responds_with_last_output() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));

    let pipeline = RequestPipeline::new()
        .stage(stage_fn("double", |_, _, _| Ok(Step::Continue(json!(21)))))
        .stage(stage_fn("load", |lp, cx, input| {
            assert_eq!(cx.output("double"), Some(&json!(21)));
            let doubled = input.as_u64().unwrap_or_default() * 2;
            Ok(Step::Await(completing_after(lp, 3, json!(doubled))))
        }));

    assert_eq!(pipeline.stage_names(), vec!["double", "load"]);
    pipeline.run(&lp, request(&responses));
    assert!(responses.borrow().is_empty());

    lp.run().unwrap();
    assert_eq!(*responses.borrow(), vec![Response::ok(json!(42))]);
}

#[test]
fn test_cancel_short_circuits_before_next_stage() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let second_ran = Rc::new(Cell::new(false));

    let pipeline = {
        let second_ran = second_ran.clone();
        RequestPipeline::new()
            .stage(stage_fn("slow", |lp, _, _| {
                Ok(Step::Await(completing_after(lp, 50, json!("late"))))
            }))
            .stage(stage_fn("after", move |_, _, _| {
                second_ran.set(true);
                Ok(Step::Continue(Value::Null))
            }))
    };

    let cx = request(&responses);
    let token = cx.cancel_token();
    pipeline.run(&lp, cx);
    token.cancel();
    lp.run().unwrap();

    assert!(!second_ran.get());
    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind(), Some(ErrorKind::Canceled));
    assert_eq!(responses[0].status(), 499);
}

#[test]
fn test_panicking_stage_becomes_internal_error() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let reports = Rc::new(RefCell::new(Vec::new()));
    {
        let reports = reports.clone();
        lp.set_error_sink(move |error: &TaskError, phase: Option<Phase>, label: &str| {
            reports
                .borrow_mut()
                .push((phase, label.to_string(), error.clone()));
        });
    }

    let pipeline = RequestPipeline::new()
        .stage(stage_fn("load", |lp, _, _| {
            Ok(Step::Await(completing_after(lp, 0, json!([]))))
        }))
        .stage(stage_fn("explode", |_, _, input| {
            panic!("no first element in {input}");
        }));

    pipeline.run(&lp, request(&responses));
    lp.run().unwrap();

    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind(), Some(ErrorKind::Internal));
    assert_eq!(
        responses[0].body(),
        json!({ "error": "internal", "message": "internal server error" })
    );

    let reports = reports.borrow();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, Some(Phase::Io));
    assert_eq!(reports[0].1, "explode");
    assert!(matches!(reports[0].2, TaskError::Panicked(_)));
}

#[test]
fn test_panic_before_the_first_tick_reports_mainline() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let phases = Rc::new(RefCell::new(Vec::new()));
    {
        let phases = phases.clone();
        lp.set_error_sink(move |_: &TaskError, phase: Option<Phase>, _: &str| {
            phases.borrow_mut().push(phase);
        });
    }

    let pipeline = RequestPipeline::new().stage(stage_fn("route", |_, _, _| {
        panic!("routing table missing");
    }));

    pipeline.run(&lp, request(&responses));

    assert_eq!(*phases.borrow(), vec![None]);
    assert_eq!(responses.borrow()[0].kind(), Some(ErrorKind::Internal));
}

#[test]
fn test_lost_operation_still_answers_once() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));
    let phases = Rc::new(RefCell::new(Vec::new()));
    let resumed = Rc::new(Cell::new(false));
    {
        let phases = phases.clone();
        lp.set_error_sink(move |_: &TaskError, phase: Option<Phase>, _: &str| {
            phases.borrow_mut().push(phase);
        });
    }

    let pipeline = {
        let resumed = resumed.clone();
        RequestPipeline::new()
            .stage(stage_fn("load", |lp, _, _| {
                let op: AsyncOperation<Value, PipelineError> = lp.create_operation();
                let target = op.clone();
                // Panics while holding the only handle that could settle `op`.
                lp.set_timeout(5, move |_| {
                    if target.is_pending() {
                        panic!("driver crashed");
                    }
                });
                Ok(Step::Await(op))
            }))
            .stage(stage_fn("after", move |_, _, _| {
                resumed.set(true);
                Ok(Step::Continue(Value::Null))
            }))
    };

    pipeline.run(&lp, request(&responses));
    lp.run().unwrap();

    assert!(!resumed.get());
    let responses = responses.borrow();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].kind(), Some(ErrorKind::Internal));
    assert_eq!(responses[0].status(), 500);
    assert_eq!(*phases.borrow(), vec![Some(Phase::Timer)]);
    assert_eq!(lp.pending_operations(), 0);
}

#[test]
fn test_validation_error_from_first_stage() {
    let lp = manual_loop();
    let responses = Rc::new(RefCell::new(Vec::new()));

    let pipeline = RequestPipeline::new().stage(stage_fn("check", |_, cx, _| {
        if cx.body.is_none() {
            return Err(PipelineError::validation("body required"));
        }
        Ok(Step::Continue(Value::Null))
    }));

    pipeline.run(&lp, request(&responses));
    assert_eq!(responses.borrow()[0].status(), 400);
    assert!(lp.is_idle());
}
