use crate::context::Context;
use crate::error::{ErrorKind, PipelineError};
use crate::response::Response;
use cadence_scheduler::{AsyncOperation, EventLoop, TaskError};
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// What a stage hands back to the driver.
pub enum Step {
    /// Finish the request with this response.
    Respond(Response),
    /// Pass `Value` straight to the next stage.
    Continue(Value),
    /// Suspend; the next stage runs with the operation's value once it
    /// settles, or the request fails with its error.
    Await(AsyncOperation<Value, PipelineError>),
}

/// One step of a [`RequestPipeline`].
///
/// A stage body runs to completion without yielding. Work that has to wait
/// is expressed by returning [`Step::Await`].
pub trait Stage {
    fn name(&self) -> &'static str;

    fn run(&self, lp: &EventLoop, cx: &mut Context, input: Value) -> Result<Step, PipelineError>;
}

/// A [`Stage`] built from a closure.
pub struct FnStage<F> {
    name: &'static str,
    f: F,
}

pub fn stage_fn<F>(name: &'static str, f: F) -> FnStage<F>
where
    F: Fn(&EventLoop, &mut Context, Value) -> Result<Step, PipelineError>,
{
    FnStage { name, f }
}

impl<F> Stage for FnStage<F>
where
    F: Fn(&EventLoop, &mut Context, Value) -> Result<Step, PipelineError>,
{
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&self, lp: &EventLoop, cx: &mut Context, input: Value) -> Result<Step, PipelineError> {
        (self.f)(lp, cx, input)
    }
}

/// Ordered stages driven over the event loop.
///
/// Cloning is cheap; clones share the stage list.
#[derive(Clone, Default)]
pub struct RequestPipeline {
    stages: Rc<Vec<Rc<dyn Stage>>>,
}

impl RequestPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        Rc::make_mut(&mut self.stages).push(Rc::new(stage));
        self
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Starts `cx` at the first stage. The response arrives through the
    /// context's responder, exactly once.
    pub fn run(&self, lp: &EventLoop, mut cx: Context) {
        cx.bind(lp);
        tracing::debug!(request = cx.id, method = %cx.method, path = %cx.path, "request started");
        self.advance(lp, cx, 0, Value::Null);
    }

    fn advance(&self, lp: &EventLoop, mut cx: Context, mut index: usize, mut input: Value) {
        loop {
            if cx.is_canceled() {
                self.fail(lp, cx, "cancel", PipelineError::Canceled);
                return;
            }
            let Some(stage) = self.stages.get(index).cloned() else {
                self.respond(lp, cx, Response::ok(input));
                return;
            };

            let name = stage.name();
            let _span = tracing::debug_span!("stage", request = cx.id, stage = name).entered();
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| stage.run(lp, &mut cx, input)));

            match outcome {
                Err(payload) => {
                    let error = TaskError::from_panic(payload);
                    lp.report_error(&error, lp.current_phase(), name);
                    let response = Response::from_error(&PipelineError::Internal(error.to_string()));
                    self.respond(lp, cx, response);
                    return;
                }
                Ok(Err(error)) => {
                    self.fail(lp, cx, name, error);
                    return;
                }
                Ok(Ok(Step::Respond(response))) => {
                    self.respond(lp, cx, response);
                    return;
                }
                Ok(Ok(Step::Continue(value))) => {
                    cx.record_output(name, value.clone());
                    input = value;
                    index += 1;
                }
                Ok(Ok(Step::Await(operation))) => {
                    tracing::trace!(request = cx.id, operation = %operation.id(), "stage suspended");
                    let pipeline = self.clone();
                    operation.on_settled(move |lp, outcome| {
                        if cx.is_canceled() {
                            pipeline.fail(lp, cx, name, PipelineError::Canceled);
                            return;
                        }
                        match outcome {
                            Ok(value) => {
                                cx.record_output(name, value.clone());
                                pipeline.advance(lp, cx, index + 1, value);
                            }
                            Err(error) => pipeline.fail(lp, cx, name, error),
                        }
                    });
                    return;
                }
            }
        }
    }

    fn fail(&self, lp: &EventLoop, cx: Context, stage: &'static str, error: PipelineError) {
        match error.kind() {
            ErrorKind::Validation | ErrorKind::NotFound => {
                tracing::warn!(request = cx.id, stage, %error, "request rejected");
            }
            ErrorKind::Datastore => {
                tracing::error!(request = cx.id, stage, %error, "datastore failure");
            }
            ErrorKind::Internal => {
                lp.report_error(&TaskError::failed(error.to_string()), lp.current_phase(), stage);
            }
            ErrorKind::Canceled => {
                tracing::debug!(request = cx.id, stage, "request canceled");
            }
        }
        self.respond(lp, cx, Response::from_error(&error));
    }

    fn respond(&self, lp: &EventLoop, cx: Context, response: Response) {
        tracing::debug!(request = cx.id, status = response.status(), "request finished");
        cx.respond(lp, response);
    }
}
