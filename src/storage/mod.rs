//! Relational persistence for the monitored job fields.
//!
//! Only the job slice the reconciliation loop needs lives here; the wider
//! business schema (organizations, projects, images) belongs to the
//! surrounding system.

pub mod jobs;

// Re-export main types for convenience
pub use jobs::{JobRecord, JobStore, PgJobStore, StoreError};
