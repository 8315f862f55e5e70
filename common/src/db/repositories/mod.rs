// Repository layer for database operations

pub mod oracle_watch;
pub mod subscriber;
pub mod trigger;

pub use oracle_watch::OracleWatchRepository;
pub use subscriber::SubscriberRepository;
pub use trigger::TriggerRepository;
