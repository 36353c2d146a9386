//! Service layer
//!
//! The components the scheduler loop drives: fleet-wide locking, the worker
//! pool running the polls, the aggregator owning the run statistics and the
//! reporter closing a run.

mod aggregator;
mod executor;
mod lock_coordinator;
mod reporter;

pub use aggregator::ResultAggregator;
pub use executor::{CommandPollRunner, PollRunner, WorkerPool};
pub use lock_coordinator::LockCoordinator;
pub use reporter::RunReporter;
