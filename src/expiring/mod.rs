//! Expiring key-value store backends.

mod memory;

pub use memory::InMemoryExpiringStore;
