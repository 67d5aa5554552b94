#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Core abstractions for the FinFlow orchestration runtime
//!
//! This crate defines the seams the orchestrator is built on: the injectable
//! clock, cooperative cancellation, the handler contract and registry, the
//! task record with its lifecycle state machine, the observer event bus, and
//! the optional persistence interface.

pub mod cancel;
pub mod clock;
pub mod events;
pub mod handler;
pub mod store;
pub mod task;

pub use cancel::CancelToken;
pub use clock::{BackoffPolicy, Clock, ManualClock, SystemClock};
pub use events::{CoreEvent, EventBus};
pub use handler::{
    FnHandler, HandlerContext, HandlerRegistry, ProgressReporter, ProgressSink, TaskHandler,
};
pub use store::{MemoryStore, TaskStore};
pub use task::{ExecutionFilter, Task, TaskExecution};
