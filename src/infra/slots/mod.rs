//! Slot table backends.

pub mod memory;

pub use memory::InMemorySlotStore;
