use crate::task::{Phase, TaskError};

/// Receives every error the loop catches from a callback.
///
/// `phase` is `None` when the error was raised by mainline code, outside
/// any tick.
pub trait ErrorSink {
    fn report(&self, error: &TaskError, phase: Option<Phase>, callback: &str);
}

/// Default sink: one `error!` event per report.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, error: &TaskError, phase: Option<Phase>, callback: &str) {
        let phase = phase.map_or("mainline", |phase| phase.as_str());
        tracing::error!(phase, callback, %error, "unhandled callback error");
    }
}

impl<F> ErrorSink for F
where
    F: Fn(&TaskError, Option<Phase>, &str),
{
    fn report(&self, error: &TaskError, phase: Option<Phase>, callback: &str) {
        self(error, phase, callback)
    }
}
