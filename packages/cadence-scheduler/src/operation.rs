use crate::event_loop::{EventLoop, WeakLoop};
use crate::task::{Callback, Phase};
use serde::Serialize;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct OperationId(pub(crate) u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        })
    }
}

/// A second `complete`/`fail` on an operation that has already settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{id} is already {status}")]
pub struct AlreadySettled {
    pub id: OperationId,
    pub status: OperationStatus,
}

type Continuation<T, E> = Box<dyn FnOnce(&EventLoop, Result<T, E>)>;

enum State<T, E> {
    Pending,
    Completed(T),
    Failed(E),
}

struct OpInner<T, E> {
    id: OperationId,
    state: State<T, E>,
    continuations: SmallVec<[Continuation<T, E>; 2]>,
    owner: WeakLoop,
}

impl<T, E> Drop for OpInner<T, E> {
    fn drop(&mut self) {
        if matches!(self.state, State::Pending) {
            if let Some(lp) = self.owner.upgrade() {
                tracing::warn!(id = %self.id, "operation dropped while pending");
                lp.operation_settled();
            }
        }
    }
}

/// Deferred work that settles exactly once.
///
/// Continuations never run inline: settling moves them onto the I/O queue
/// in registration order, and registering on a settled operation enqueues
/// right away. Each continuation gets its own clone of the outcome.
pub struct AsyncOperation<T, E> {
    inner: Rc<RefCell<OpInner<T, E>>>,
}

impl<T, E> Clone for AsyncOperation<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> AsyncOperation<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// A new pending operation, counted by `lp` until it settles.
    pub fn new(lp: &EventLoop) -> Self {
        let id = lp.operation_created();
        tracing::trace!(%id, "operation created");
        Self::with_state(lp, id, State::Pending)
    }

    pub fn completed(lp: &EventLoop, value: T) -> Self {
        let id = lp.next_operation_id();
        Self::with_state(lp, id, State::Completed(value))
    }

    pub fn failed(lp: &EventLoop, error: E) -> Self {
        let id = lp.next_operation_id();
        Self::with_state(lp, id, State::Failed(error))
    }

    fn with_state(lp: &EventLoop, id: OperationId, state: State<T, E>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(OpInner {
                id,
                state,
                continuations: SmallVec::new(),
                owner: lp.downgrade(),
            })),
        }
    }

    pub fn id(&self) -> OperationId {
        self.inner.borrow().id
    }

    pub fn status(&self) -> OperationStatus {
        match self.inner.borrow().state {
            State::Pending => OperationStatus::Pending,
            State::Completed(_) => OperationStatus::Completed,
            State::Failed(_) => OperationStatus::Failed,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == OperationStatus::Pending
    }

    pub fn result(&self) -> Option<T> {
        match &self.inner.borrow().state {
            State::Completed(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<E> {
        match &self.inner.borrow().state {
            State::Failed(error) => Some(error.clone()),
            _ => None,
        }
    }

    pub fn complete(&self, value: T) -> Result<(), AlreadySettled> {
        self.settle(State::Completed(value))
    }

    pub fn fail(&self, error: E) -> Result<(), AlreadySettled> {
        self.settle(State::Failed(error))
    }

    fn settle(&self, outcome: State<T, E>) -> Result<(), AlreadySettled> {
        let (id, continuations, owner) = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(inner.state, State::Pending) {
                let status = match inner.state {
                    State::Completed(_) => OperationStatus::Completed,
                    _ => OperationStatus::Failed,
                };
                tracing::warn!(id = %inner.id, %status, "settle on a settled operation");
                return Err(AlreadySettled {
                    id: inner.id,
                    status,
                });
            }
            inner.state = outcome;
            (
                inner.id,
                std::mem::take(&mut inner.continuations),
                inner.owner.clone(),
            )
        };

        let Some(lp) = owner.upgrade() else {
            tracing::warn!(%id, "operation settled after its loop was dropped");
            return Ok(());
        };
        lp.operation_settled();
        tracing::trace!(%id, continuations = continuations.len(), "operation settled");

        for continuation in continuations {
            self.schedule(&lp, continuation);
        }
        Ok(())
    }

    fn outcome(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Completed(value) => Some(Ok(value.clone())),
            State::Failed(error) => Some(Err(error.clone())),
        }
    }

    fn schedule(&self, lp: &EventLoop, continuation: Continuation<T, E>) {
        let Some(outcome) = self.outcome() else {
            return;
        };
        let id = self.id();
        lp.enqueue_task(
            Phase::Io,
            Callback::new(move |lp: &EventLoop| continuation(lp, outcome))
                .with_label(format!("{id} continuation")),
        );
    }

    /// Runs `f` with the outcome in a later I/O phase.
    pub fn on_settled<F>(&self, f: F)
    where
        F: FnOnce(&EventLoop, Result<T, E>) + 'static,
    {
        let owner = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Pending) {
                inner.continuations.push(Box::new(f));
                return;
            }
            inner.owner.clone()
        };
        match owner.upgrade() {
            Some(lp) => self.schedule(&lp, Box::new(f)),
            None => tracing::warn!(id = %self.id(), "continuation dropped, loop is gone"),
        }
    }

    fn settle_result(&self, outcome: Result<T, E>) -> Result<(), AlreadySettled> {
        match outcome {
            Ok(value) => self.complete(value),
            Err(error) => self.fail(error),
        }
    }

    /// A new operation that settles with `f` applied to this one's whole
    /// outcome. One continuation, so one I/O hop.
    pub fn map_result<U, F, G>(&self, lp: &EventLoop, f: G) -> AsyncOperation<U, F>
    where
        U: Clone + 'static,
        F: Clone + 'static,
        G: FnOnce(Result<T, E>) -> Result<U, F> + 'static,
    {
        let mapped = AsyncOperation::new(lp);
        let target = mapped.clone();
        self.on_settled(move |_, outcome| {
            // `target` is private to this closure, so it is still pending here.
            let settled = target.settle_result(f(outcome));
            debug_assert!(settled.is_ok());
        });
        mapped
    }

    pub fn map<U, G>(&self, lp: &EventLoop, f: G) -> AsyncOperation<U, E>
    where
        U: Clone + 'static,
        G: FnOnce(T) -> U + 'static,
    {
        self.map_result(lp, move |outcome| outcome.map(f))
    }

    /// Like [`map`](Self::map), for the error side.
    pub fn map_err<F, G>(&self, lp: &EventLoop, f: G) -> AsyncOperation<T, F>
    where
        F: Clone + 'static,
        G: FnOnce(E) -> F + 'static,
    {
        self.map_result(lp, move |outcome| outcome.map_err(f))
    }

    /// Starts the operation `f` returns once this one completes, and
    /// settles with its outcome. A failure skips `f`.
    pub fn and_then<U, G>(&self, lp: &EventLoop, f: G) -> AsyncOperation<U, E>
    where
        U: Clone + 'static,
        G: FnOnce(&EventLoop, T) -> AsyncOperation<U, E> + 'static,
    {
        let chained = AsyncOperation::new(lp);
        let target = chained.clone();
        self.on_settled(move |lp, outcome| match outcome {
            Ok(value) => f(lp, value).on_settled(move |_, outcome| {
                let settled = target.settle_result(outcome);
                debug_assert!(settled.is_ok());
            }),
            Err(error) => {
                let settled = target.fail(error);
                debug_assert!(settled.is_ok());
            }
        });
        chained
    }
}

impl<T, E> fmt::Debug for AsyncOperation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        let status = match inner.state {
            State::Pending => OperationStatus::Pending,
            State::Completed(_) => OperationStatus::Completed,
            State::Failed(_) => OperationStatus::Failed,
        };
        f.debug_struct("AsyncOperation")
            .field("id", &inner.id)
            .field("status", &status)
            .field("continuations", &inner.continuations.len())
            .finish()
    }
}
