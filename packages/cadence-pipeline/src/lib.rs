//! Request pipelines on the cadence event loop.
//!
//! A [`RequestPipeline`] runs a fixed list of [`Stage`]s for one
//! [`Context`]. Stages either answer, hand a value straight on, or suspend
//! on an [`AsyncOperation`](cadence_scheduler::AsyncOperation); the driver
//! resumes them from the loop's I/O phase.

pub mod context;
pub mod error;
pub mod pipeline;
pub mod response;
pub mod service;
pub mod store;

pub use context::{CancelToken, Context, Method, Responder};
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{FnStage, RequestPipeline, Stage, Step, stage_fn};
pub use response::Response;
pub use service::{Command, ItemQuery, Route, ShoppingService, shopping_store};
pub use store::{Datastore, Filter, MemoryStore, StoreConfig, StoreError};
