//! Tickpool — a tick-drained background task dispatcher
//!
//! Hosts with a single designated main loop (a game or simulation tick)
//! offload work to a fixed pool of background threads, while every
//! result-handling callback runs back on the main loop, never concurrently
//! with it. The host owns the polling: it calls [`Dispatcher::drain`] once
//! per tick to finalize completed tasks, and may submit new work from any
//! thread at any time.
//!
//! - [`Dispatcher`] — owns the worker pool and the live task registry
//! - [`Worker`] — one FIFO queue, one dedicated thread
//! - [`Task`] — a body, an optional completion callback, a mode, an affinity

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod dispatcher;
pub mod task;
pub mod worker;

pub use dispatcher::{Dispatcher, SubmitOptions};
pub use task::{Affinity, Task, TaskId, TaskMode, TaskOutcome};
pub use worker::Worker;

/// Dispatch errors reported synchronously at the control surface.
/// There is no deferred error channel; task body failures surface as
/// [`TaskOutcome::Failed`] through the completion path instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The worker pool can never be empty
    #[error("worker count can't be zero")]
    InvalidWorkerCount,

    /// A pinned affinity index outside the current pool
    #[error("worker index {index} out of range (pool has {worker_count} workers)")]
    InvalidWorkerIndex {
        /// The requested pool index
        index: usize,
        /// Pool size at routing time
        worker_count: usize,
    },
}

/// Dispatch result
pub type DispatchResult<T> = Result<T, DispatchError>;
