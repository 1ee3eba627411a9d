//! Background maintenance
//!
//! A single worker periodically re-syncs stale subscriptions with the payment
//! processor and runs the daily lifecycle checks (lapsed trials, renewal reminders).

mod config;
mod maintenance;

pub use config::MaintenanceConfig;
pub use maintenance::{MaintenanceHandle, MaintenanceWorker};
