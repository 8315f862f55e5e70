// Epoch notifier core: chain access, triggers, scheduling and delivery

pub mod chain;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod notifications;
pub mod queue;
pub mod retry;
pub mod router;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod triggers;
