//! Lease tables backing the advisory lock.

pub mod file;
pub mod memory;

pub use file::FileLockStore;
pub use memory::InMemoryLockStore;

use serde::{Deserialize, Serialize};

/// One held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Lease {
    pub(crate) owner: String,
    pub(crate) expires_at_ms: u128,
}

impl Lease {
    pub(crate) fn blocks(&self, owner: &str, now_ms: u128) -> bool {
        self.owner != owner && self.expires_at_ms > now_ms
    }
}
