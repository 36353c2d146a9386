//! Poller Core
//!
//! Core types for the fleet-wide device polling scheduler.
//!
//! This crate contains the domain types shared between the storage layer
//! (which reads devices and persists run summaries) and the scheduler
//! service (which dispatches polls and aggregates their outcomes).

pub mod domain;
