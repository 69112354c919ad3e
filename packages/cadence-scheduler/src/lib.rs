//! Single-threaded, phase-ordered event loop.
//!
//! A tick visits the timer, I/O, check and close phases in order; the
//! microtask queue is drained after every callback. Deferred work is
//! modelled by [`AsyncOperation`], whose continuations always run in a
//! later I/O phase.

pub mod builder;
pub mod clock;
pub mod event_loop;
pub mod operation;
pub mod queue;
pub mod sink;
pub mod task;

pub use builder::LoopBuilder;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use event_loop::{EventLoop, LoopError, LoopStats, WeakLoop};
pub use operation::{AlreadySettled, AsyncOperation, OperationId, OperationStatus};
pub use queue::{ReadyTimer, TaskQueue, TimerError, TimerHandle};
pub use sink::{ErrorSink, TracingSink};
pub use task::{Callback, Phase, TaskError};
