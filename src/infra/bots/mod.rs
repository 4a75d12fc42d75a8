//! Bot record backends.

pub mod memory;

pub use memory::InMemoryBotRegistry;
