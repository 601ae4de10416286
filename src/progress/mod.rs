//! Best-effort progress accounting for in-flight jobs.
//!
//! This module tracks how much of a job's work remains, independent of the
//! task queue:
//!
//! - **ProgressTracker**: per-job (optionally per-stage) pending-id sets
//!   with derived remaining / processed / percentage
//! - **AdvisoryLock**: short-TTL, owner-tagged lock guarding pending-set
//!   mutation; contention means "skip this update", never an error
//!
//! Reads are lock-free and may be stale. Progress is a reporting signal,
//! not a correctness boundary; it converges as long as some caller
//! eventually reports every id.

pub mod lock;
pub mod tracker;

// Re-export main types for convenience
pub use lock::{AdvisoryLock, LockGuard, TryLock};
pub use tracker::{ProgressError, ProgressTracker, TaskProgress};
