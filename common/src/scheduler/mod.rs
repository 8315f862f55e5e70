// Epoch lifecycle: trigger restarts and the subscriber map

pub mod engine;
pub mod subscribers;

pub use engine::{refresh_identities, sync_subscribers, EpochScheduler, SchedulerState};
pub use subscribers::SharedSubscribers;
