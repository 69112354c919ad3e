use serde::Serialize;
use std::any::Any;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// The named stages of one loop tick, plus the microtask queue that runs
/// between every two phase callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Phase {
    Microtask,
    Timer,
    Io,
    Check,
    Close,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Microtask => "microtask",
            Phase::Timer => "timer",
            Phase::Io => "io",
            Phase::Check => "check",
            Phase::Close => "close",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a callback body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
    #[error("callback panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }

    /// Converts a `catch_unwind` payload, keeping its message when it has one.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        TaskError::Panicked(message)
    }
}

type Body<Cx> = Box<dyn FnOnce(&Cx) -> Result<(), TaskError>>;

/// A labelled, run-once unit of work.
///
/// `Cx` is whatever the executor hands the body when it runs; for the
/// event loop that is the loop itself, so a callback can schedule more
/// work.
pub struct Callback<Cx> {
    label: Cow<'static, str>,
    body: Body<Cx>,
}

impl<Cx> Callback<Cx> {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&Cx) + 'static,
    {
        Self {
            label: Cow::Borrowed("anonymous"),
            body: Box::new(move |cx| {
                f(cx);
                Ok(())
            }),
        }
    }

    /// A callback whose body can fail; an `Err` is routed to the loop's
    /// error sink like a panic would be.
    pub fn fallible<F>(f: F) -> Self
    where
        F: FnOnce(&Cx) -> Result<(), TaskError> + 'static,
    {
        Self {
            label: Cow::Borrowed("anonymous"),
            body: Box::new(f),
        }
    }

    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn invoke(self, cx: &Cx) -> Result<(), TaskError> {
        (self.body)(cx)
    }

    pub(crate) fn into_parts(self) -> (Cow<'static, str>, Body<Cx>) {
        (self.label, self.body)
    }
}

impl<Cx> fmt::Debug for Callback<Cx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}
