//! Infrastructure adapters: platform backends and the slot, queue, lock and
//! bot record stores.

pub mod backends;
pub mod bots;
pub mod lock;
pub mod queue;
pub mod slots;

pub use backends::{HttpPaasBackend, InMemoryBackend, LocalProcessBackend};
pub use bots::InMemoryBotRegistry;
pub use lock::{FileLockStore, InMemoryLockStore};
pub use queue::{InMemoryQueue, YaqueQueue};
pub use slots::InMemorySlotStore;
