//! Job dispatch and the worker side of the queue.
//!
//! - **JobDispatcher**: publishes a job's task list and initializes its
//!   progress tracking; also handles cancellation
//! - **WorkerPool / TaskHandler**: elastic pool of workers that reserve
//!   batches, run the (external) image pipeline, acknowledge and report
//!   progress

pub mod dispatcher;
pub mod worker;

// Re-export main types for convenience
pub use dispatcher::{tasks_from_manifest, DispatchError, JobDispatcher};
pub use worker::{HandlerError, PoolError, PoolStats, TaskHandler, WorkerPool, WorkerPoolConfig};
