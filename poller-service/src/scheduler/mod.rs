//! Scheduler layer
//!
//! Selects the most stale device on every pass and hands it to the worker
//! pool, coordinating with peer instances through the lock coordinator.

mod feeder;

pub use feeder::{PollScheduler, SchedulerSettings};
