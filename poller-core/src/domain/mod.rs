//! Core domain types
//!
//! These types represent the entities the scheduler works with: monitored
//! devices, the named locks that guard them, individual polls and the
//! statistics of a whole run.

pub mod device;
pub mod lock;
pub mod poll;
pub mod run;
