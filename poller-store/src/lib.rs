//! Poller Store
//!
//! Data access for the polling scheduler: the device catalog, the per-poller
//! run summaries and the named advisory locks shared by every scheduler
//! instance and the external poller.
//!
//! Repositories are trait-based. MySQL implementations talk to the shared
//! database; in-memory implementations back the tests and let several
//! scheduler instances be simulated in one process.

pub mod db;
pub mod error;
pub mod repository;

pub use error::{Result, StoreError};
