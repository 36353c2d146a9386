//! Repository layer
//!
//! Each repository covers one concern of the shared catalog database and
//! exposes it through a trait so the scheduler can run against MySQL in
//! production and against the in-memory implementations in tests.

mod devices;
mod locks;
#[cfg(any(test, feature = "memory"))]
mod memory;
mod pollers;

// Re-export traits
pub use devices::DeviceRepository;
pub use locks::LockRepository;
pub use pollers::{PollerRepository, UpsertOutcome};

// Re-export implementations
pub use devices::MySqlDeviceRepository;
pub use locks::MySqlLockRepository;
#[cfg(any(test, feature = "memory"))]
pub use memory::{MemoryCatalog, MemoryLockSession, MemoryLockSpace};
pub use pollers::MySqlPollerRepository;
