//! Broker connectivity and per-job task queues.
//!
//! This module owns everything that talks to the message broker:
//!
//! - **ConnectionProvider / ProviderRegistry**: one lazily-created,
//!   resettable connection per concurrency context
//! - **TaskQueueCoordinator**: per-job stream + pull consumer group,
//!   publish / reserve / acknowledge / cleanup
//!
//! # Architecture
//!
//! ```text
//!                 ┌────────────────┐
//!                 │   Dispatcher   │
//!                 └───────┬────────┘
//!                         │ publish job_<id>
//!                 ┌───────▼────────┐
//!                 │  Broker stream │
//!                 │  + pull group  │
//!                 └───────┬────────┘
//!            reserve (disjoint batches)
//!         ┌───────────────┼───────────────┐
//!         ▼               ▼               ▼
//!    ┌─────────┐     ┌─────────┐     ┌─────────┐
//!    │ Worker 1│     │ Worker 2│     │ Worker N│
//!    └─────────┘     └─────────┘     └─────────┘
//! ```
//!
//! Delivery is at-least-once: an unacknowledged task is redelivered to a
//! different worker after the redelivery timeout, so task processing must
//! be idempotent with respect to duplicates.

pub mod connection;
pub mod coordinator;

// Re-export main types for convenience
pub use connection::{BrokerError, ConnectionProvider, ProviderRegistry};
pub use coordinator::{
    consumer_group, stream_name, task_subject, AckHandle, ReservedTask, TaskQueueCoordinator,
    TaskRecord,
};
