//! Platform backend adapters.

pub mod local;
pub mod memory;
pub mod paas;

pub use local::LocalProcessBackend;
pub use memory::InMemoryBackend;
pub use paas::HttpPaasBackend;
