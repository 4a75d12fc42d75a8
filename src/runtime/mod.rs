//! Runtime adapters, background supervision and the administrative API
//! surface.

pub mod api;
pub mod supervisor;
pub mod tokio_spawner;

pub use api::{
    delete_slots, health, heartbeat, list_queue, list_slots, trigger_reconciliation, DeleteSlotsReport, Health,
    HeartbeatAck, QueueEntryView, QueueListing, SlotPage, SlotView,
};
pub use supervisor::Supervisor;
pub use tokio_spawner::TokioSpawner;
