//! Background job scheduling: cluster locks, the scheduler registry, the
//! execution envelope and the task delegates.

pub mod context;
pub mod delegate;
pub mod delegates;
pub mod envelope;
pub mod error;
pub mod interrupt;
pub mod key;
pub mod lock;
pub mod manager;
pub mod sched_task;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{JobContext, JobExecutionContext};
pub use delegate::{DelegateRegistry, JobDependencies, TaskJobDelegate};
pub use envelope::{ExecutionOutcome, JobBody, JobEnvelope, JobKind};
pub use error::JobError;
pub use interrupt::InterruptState;
pub use key::JobKey;
pub use lock::{InMemoryJobLock, JobLock, StoreJobLock};
pub use manager::{JobManager, JobManagerSettings, LoadSummary};
pub use scheduler::{SchedulerSettings, TaskScheduler};
