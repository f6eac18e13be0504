//! Syncope Scheduler Library
//!
//! Cluster-aware task scheduling with identity synchronization jobs.

pub mod audit;
pub mod config;
pub mod job;
pub mod metrics;
pub mod security;
pub mod sqlite_persistence;
pub mod store;
pub mod sync;

// Re-export commonly used types for convenience
pub use job::{JobError, JobManager, JobManagerSettings, TaskScheduler};
pub use store::{JobStore, SqliteJobStore};
